//! Delete and garbage collection flows against the in-memory cloud

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stackherd::config::EngineConfig;
use stackherd::reclaim::CleanupResult;
use stackherd::{Deployer, StackConfig};
use stackherd_common::tags::TAG_ROOT_STACK_NAME;
use stackherd_test_utils::fixtures::PLAIN_TEMPLATE;
use stackherd_test_utils::{FakeCloud, TemplateTree, output_ref, stack_config, stack_resource};

const REGION: &str = "eu-west-1";

const FUNCTION_ONLY: &str = r#"Resources:
  Handler:
    Type: AWS::Serverless::Function
    Properties:
      CodeUri: ./src
      Handler: index.handler
      Runtime: nodejs20.x
"#;

const LOGS_BUCKET: &str = "arn:aws:s3:::app-logs";
const ROLE: &str = "arn:aws:iam::123456789012:role/app-role";
const QUEUE: &str = "arn:aws:sqs:eu-west-1:123456789012:app-jobs";

fn deployer(cloud: &Arc<FakeCloud>) -> Deployer {
    let config = EngineConfig {
        poll_interval: Duration::from_millis(1),
        delete_batch_size: 2,
        ..Default::default()
    };
    Deployer::new(cloud.services(), &config)
}

/// network <- app, both already deployed
fn network_and_app(
    cloud: &FakeCloud,
    tree: &TemplateTree,
    app_extra: serde_json::Value,
) -> Vec<StackConfig> {
    let template = tree.file("plain.yaml", PLAIN_TEMPLATE);
    let template = template.display().to_string();
    cloud.plan_outputs(REGION, "network", &[("QueueUrl", "https://sqs/queue")]);
    cloud.put_stack(REGION, "network", "CREATE_COMPLETE", Some(PLAIN_TEMPLATE));
    cloud.put_stack(REGION, "app", "CREATE_COMPLETE", Some(PLAIN_TEMPLATE));

    let mut extra = json!({ "parameters": { "Env": output_ref("network", "QueueUrl") } });
    if let (Some(base), serde_json::Value::Object(more)) = (extra.as_object_mut(), app_extra) {
        base.extend(more);
    }
    vec![
        stack_config(REGION, "network", &template, json!({})),
        stack_config(REGION, "app", &template, extra),
    ]
}

#[tokio::test]
async fn test_delete_runs_dependents_first() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let stacks = network_and_app(&cloud, &tree, json!({}));

    let report = deployer(&cloud).del(&stacks).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(
        cloud.calls_matching("delete_stack"),
        vec!["delete_stack eu-west-1/app", "delete_stack eu-west-1/network"]
    );
    assert!(cloud.stack_status(REGION, "app").is_none());
    assert!(cloud.stack_status(REGION, "network").is_none());
}

#[tokio::test]
async fn test_failed_delete_keeps_dependencies() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let stacks = network_and_app(&cloud, &tree, json!({}));
    cloud.fail_delete(REGION, "app", "Role is in use");

    let report = deployer(&cloud).del(&stacks).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.graph.failed.len(), 1);
    assert!(format!("{:#}", report.graph.failed[0].1).contains("Role is in use"));
    assert_eq!(report.graph.blocked[0].name, "network");
    assert_eq!(
        cloud.stack_status(REGION, "network").as_deref(),
        Some("CREATE_COMPLETE")
    );
}

#[tokio::test]
async fn test_delete_of_missing_stack_succeeds() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let template = tree.file("plain.yaml", PLAIN_TEMPLATE);
    let stacks = vec![stack_config(
        REGION,
        "gone",
        &template.display().to_string(),
        json!({}),
    )];

    let report = deployer(&cloud).del(&stacks).await.unwrap();
    assert!(report.is_success());
    assert!(cloud.calls_matching("delete_stack").is_empty());
}

#[tokio::test]
async fn test_retained_resources_are_reported_without_force() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let stacks = network_and_app(&cloud, &tree, json!({}));
    cloud.tag_resource(REGION, QUEUE, &[(TAG_ROOT_STACK_NAME, "app")]);

    let report = deployer(&cloud).del(&stacks).await.unwrap();

    assert!(report.is_success());
    let skipped: Vec<_> = report.cleanup.retained.skipped().collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].arn, QUEUE);
    assert_eq!(cloud.tagged_arns(), vec![QUEUE.to_string()]);
}

#[tokio::test]
async fn test_forced_delete_reclaims_retained_resources() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let stacks = network_and_app(&cloud, &tree, json!({ "flags": { "forceDelete": true } }));
    cloud.tag_resource(REGION, LOGS_BUCKET, &[(TAG_ROOT_STACK_NAME, "app")]);
    cloud.tag_resource("us-east-1", ROLE, &[(TAG_ROOT_STACK_NAME, "app")]);
    for key in ["a.log", "b.log", "c.log"] {
        cloud.put_object_with_tags("app-logs", key, b"log", &[]);
    }

    let report = deployer(&cloud).del(&stacks).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.cleanup.retained.count(CleanupResult::Deleted), 2);
    assert!(!cloud.bucket_exists("app-logs"));
    assert!(cloud.tagged_arns().is_empty());
    // Three objects in batches of two
    assert_eq!(cloud.calls_matching("delete_objects app-logs").len(), 2);
    // Roles are assumed by everything else and go last
    let calls = cloud.calls();
    let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
    assert!(
        position("delete_bucket app-logs") < position(&format!("delete IamRole {ROLE}"))
    );
}

#[tokio::test]
async fn test_skip_retained_cleanup() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let stacks = network_and_app(
        &cloud,
        &tree,
        json!({ "flags": { "forceDelete": true, "skipRetainedCleanup": true } }),
    );
    cloud.tag_resource(REGION, QUEUE, &[(TAG_ROOT_STACK_NAME, "app")]);

    let report = deployer(&cloud).del(&stacks).await.unwrap();

    assert!(report.cleanup.retained.entries.is_empty());
    assert_eq!(cloud.tagged_arns(), vec![QUEUE.to_string()]);
}

#[tokio::test]
async fn test_cleanup_spares_live_resources() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    cloud.plan_resources(
        REGION,
        "app",
        vec![stack_resource("Queue", "AWS::SQS::Queue", QUEUE)],
    );
    let stacks = network_and_app(&cloud, &tree, json!({ "flags": { "forceDelete": true } }));
    cloud.tag_resource(REGION, QUEUE, &[(TAG_ROOT_STACK_NAME, "app")]);
    cloud.tag_resource("us-east-1", ROLE, &[(TAG_ROOT_STACK_NAME, "app")]);

    let report = deployer(&cloud).cleanup(&stacks).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.retained.entries.len(), 1);
    assert_eq!(report.retained.entries[0].arn, ROLE);
    assert_eq!(cloud.tagged_arns(), vec![QUEUE.to_string()]);
    assert!(cloud.calls_matching("delete_stack").is_empty());
}

#[tokio::test]
async fn test_cleanup_spares_live_role_with_path() {
    const PATHED_ROLE: &str = "arn:aws:iam::123456789012:role/service-role/app-role";

    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    cloud.plan_resources(
        REGION,
        "app",
        vec![stack_resource("Role", "AWS::IAM::Role", "app-role")],
    );
    let stacks = network_and_app(&cloud, &tree, json!({ "flags": { "forceDelete": true } }));
    cloud.tag_resource("us-east-1", PATHED_ROLE, &[(TAG_ROOT_STACK_NAME, "app")]);

    let report = deployer(&cloud).cleanup(&stacks).await.unwrap();

    assert!(report.retained.entries.is_empty(), "{report:?}");
    assert_eq!(cloud.tagged_arns(), vec![PATHED_ROLE.to_string()]);
    assert!(cloud.calls_matching("delete IamRole").is_empty());
}

#[tokio::test]
async fn test_delete_prunes_artifacts_nobody_references() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let template = tree.file("function.yaml", FUNCTION_ONLY);
    tree.file("src/index.js", "exports.handler = async () => 'ok';\n");
    let template = template.display().to_string();
    let stacks = vec![
        stack_config(REGION, "app", &template, json!({ "bucket": "artifacts" })),
        stack_config(REGION, "web", &template, json!({ "bucket": "artifacts" })),
    ];
    let deployer = deployer(&cloud);
    // One after the other, so the object tag merges do not interleave
    assert!(deployer.deploy(&stacks[..1]).await.unwrap().is_success());
    assert!(deployer.deploy(&stacks[1..]).await.unwrap().is_success());

    // Both stacks packaged the same code and root template
    let keys = cloud.object_keys("artifacts");
    assert_eq!(keys.len(), 2);
    for key in &keys {
        assert_eq!(
            cloud.object_tags("artifacts", key)[TAG_ROOT_STACK_NAME],
            "app+web"
        );
    }

    let report = deployer.del(&stacks[..1]).await.unwrap();
    assert!(report.is_success(), "{report:?}");

    // web's deployed template still points at the code; its root template
    // copy is only an upload artifact
    let pruned = &report.cleanup.pruned;
    assert_eq!(pruned.examined, 2);
    assert_eq!(pruned.kept, 1);
    assert_eq!(pruned.deleted.len(), 1);
    assert!(pruned.deleted[0].key.ends_with(".yaml"));
    let remaining = cloud.object_keys("artifacts");
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].ends_with(".zip"));

    let report = deployer.del(&stacks[1..]).await.unwrap();
    assert!(report.is_success());
    assert!(cloud.object_keys("artifacts").is_empty());
}

#[tokio::test]
async fn test_skip_prune_keeps_artifacts() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let template = tree.file("function.yaml", FUNCTION_ONLY);
    tree.file("src/index.js", "exports.handler = async () => 'ok';\n");
    let stacks = vec![stack_config(
        REGION,
        "app",
        &template.display().to_string(),
        json!({ "bucket": "artifacts", "flags": { "skipPrune": true } }),
    )];
    let deployer = deployer(&cloud);
    assert!(deployer.deploy(&stacks).await.unwrap().is_success());

    let report = deployer.del(&stacks).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.cleanup.pruned.examined, 0);
    assert_eq!(cloud.object_keys("artifacts").len(), 2);
}
