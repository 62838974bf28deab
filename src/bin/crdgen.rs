use machine_api_operator::crd::cluster_api_crds;

fn main() -> anyhow::Result<()> {
    let docs = cluster_api_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}
