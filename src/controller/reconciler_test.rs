//! Tests for the sync pipeline
//!
//! These tests verify:
//! - Stage ordering and short-circuit on failure
//! - Idempotency against a converged cluster
//! - Error context for each stage

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use tempfile::NamedTempFile;

    use crate::config::ConfigResolver;
    use crate::controller::fake::{FakeClusterApi, AWS_CONFIG, IMAGES_JSON};
    use crate::controller::reconciler::{Reconciler, Stage, SyncHandler};
    use crate::controller::ReconcileKey;
    use crate::error::Error;

    fn images_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    fn reconciler(fake: &Arc<FakeClusterApi>, images: &NamedTempFile) -> Reconciler {
        let resolver = ConfigResolver::new(fake.clone(), "openshift-machine-api", images.path());
        Reconciler::new(fake.clone(), resolver)
    }

    fn key() -> ReconcileKey {
        ReconcileKey::new("openshift-machine-api", "machine-api-operator")
    }

    fn stage_of(err: &Error) -> Option<Stage> {
        match err {
            Error::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_fresh_cluster_converges() {
        let fake = Arc::new(FakeClusterApi::with_operator_config(AWS_CONFIG));
        let images = images_file(IMAGES_JSON);

        reconciler(&fake, &images).sync(&key()).await.unwrap();

        assert_eq!(fake.crds().len(), 4);
        for (kind, name) in [
            ("Deployment", "clusterapi-apiserver"),
            ("Service", "clusterapi"),
            ("Deployment", "clusterapi-controllers"),
            ("ServiceAccount", "machine-api-controllers"),
            ("ClusterRole", "machine-api-controllers"),
            ("ClusterRoleBinding", "machine-api-controllers"),
        ] {
            assert!(fake.object(kind, name).is_some(), "{kind}/{name} not applied");
        }

        let deployment = fake.object("Deployment", "clusterapi-controllers").unwrap();
        assert_eq!(deployment["metadata"]["namespace"], "openshift-machine-api");
    }

    #[tokio::test]
    async fn test_second_run_makes_no_mutations() {
        let fake = Arc::new(FakeClusterApi::with_operator_config(AWS_CONFIG));
        let images = images_file(IMAGES_JSON);
        let r = reconciler(&fake, &images);

        r.sync(&key()).await.unwrap();
        let after_first = fake.mutations();
        assert!(after_first > 0);

        r.sync(&key()).await.unwrap();
        assert_eq!(fake.mutations(), after_first);
    }

    #[tokio::test]
    async fn test_failed_stage_stops_later_stages() {
        let fake = Arc::new(FakeClusterApi::with_operator_config(AWS_CONFIG));
        let images = images_file(IMAGES_JSON);
        fake.fail("apply:Deployment/clusterapi-apiserver", 1);

        let err = reconciler(&fake, &images).sync(&key()).await.unwrap_err();

        assert_eq!(stage_of(&err), Some(Stage::ClusterApiServer));
        assert!(matches!(err.root_cause(), Error::KubeError(kube::Error::Api(e)) if e.code == 500));
        assert!(fake.object("Deployment", "clusterapi-controllers").is_none());
        assert!(fake.object("ServiceAccount", "machine-api-controllers").is_none());
        assert_eq!(fake.calls_to("apply"), 1);
    }

    #[tokio::test]
    async fn test_crd_failure_skips_config_lookup() {
        let fake = Arc::new(FakeClusterApi::with_operator_config(AWS_CONFIG));
        let images = images_file(IMAGES_JSON);
        fake.fail("ensure_crd", 1);

        let err = reconciler(&fake, &images).sync(&key()).await.unwrap_err();

        assert_eq!(stage_of(&err), Some(Stage::RegisterCrds));
        assert_eq!(fake.calls_to("get_config_map"), 0);
        assert_eq!(fake.calls_to("apply"), 0);
    }

    #[tokio::test]
    async fn test_missing_operator_config_field() {
        let fake = Arc::new(FakeClusterApi::new());
        fake.set_config_map("kube-system", "cluster-config-v1", [("other", "{}")]);
        let images = images_file(IMAGES_JSON);

        let err = reconciler(&fake, &images).sync(&key()).await.unwrap_err();

        assert_eq!(stage_of(&err), Some(Stage::ResolveConfig));
        assert!(matches!(err.root_cause(), Error::MissingConfigField { .. }));
        assert!(err.to_string().contains("mao-config doesn't exist"));
        assert_eq!(fake.calls_to("apply"), 0);
    }

    #[tokio::test]
    async fn test_missing_cluster_config_object() {
        let fake = Arc::new(FakeClusterApi::new());
        let images = images_file(IMAGES_JSON);

        let err = reconciler(&fake, &images).sync(&key()).await.unwrap_err();
        assert_eq!(stage_of(&err), Some(Stage::ResolveConfig));
        assert!(err.to_string().contains("cluster-config-v1"));
    }

    #[tokio::test]
    async fn test_missing_controller_image_fails_controller_stage() {
        let fake = Arc::new(FakeClusterApi::with_operator_config(AWS_CONFIG));
        let images = images_file(
            r#"{"clusterAPIServer": "server:v1", "clusterAPIControllerManager": "manager:v1"}"#,
        );

        let err = reconciler(&fake, &images).sync(&key()).await.unwrap_err();

        assert_eq!(stage_of(&err), Some(Stage::ClusterApiController));
        assert!(matches!(
            err.root_cause(),
            Error::MissingImage(c) if c == "clusterAPIControllerAWS"
        ));
        // stage 4 already converged and is left in place
        assert!(fake.object("Deployment", "clusterapi-apiserver").is_some());
    }

    #[tokio::test]
    async fn test_image_manifest_is_reread_every_sync() {
        let fake = Arc::new(FakeClusterApi::with_operator_config(AWS_CONFIG));
        let images = images_file(IMAGES_JSON);
        let r = reconciler(&fake, &images);
        r.sync(&key()).await.unwrap();

        let upgraded = IMAGES_JSON.replace(
            "cluster-api-apiserver:v0.0.1",
            "cluster-api-apiserver:v0.0.2",
        );
        std::fs::write(images.path(), upgraded).unwrap();
        r.sync(&key()).await.unwrap();

        let deployment = fake.object("Deployment", "clusterapi-apiserver").unwrap();
        assert!(deployment.to_string().contains("cluster-api-apiserver:v0.0.2"));
    }

    #[test]
    fn test_stage_order() {
        let labels: Vec<&str> = Stage::ALL.iter().map(Stage::as_str).collect();
        assert_eq!(
            labels,
            vec![
                "register_crds",
                "resolve_config",
                "resolve_images",
                "cluster_api_server",
                "cluster_api_controller",
                "sync_all",
            ]
        );
    }
}
