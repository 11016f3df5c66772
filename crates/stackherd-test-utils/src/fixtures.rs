//! Stack definitions and template trees for tests

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use stackherd::StackConfig;
use tempfile::TempDir;

/// A directory of templates and artifacts that lives as long as the value
pub struct TemplateTree {
    dir: TempDir,
}

impl TemplateTree {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create template tree"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub fn file(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create fixture directory");
        }
        std::fs::write(&path, contents).expect("Failed to write fixture");
        path
    }
}

impl Default for TemplateTree {
    fn default() -> Self {
        Self::new()
    }
}

/// A stack config from its JSON form. `extra` is merged over the required
/// fields, so `json!({"dependsOn": [...]})` and friends work.
pub fn stack_config(region: &str, name: &str, template: &str, extra: Value) -> StackConfig {
    let mut config = json!({
        "region": region,
        "name": name,
        "template": template,
    });
    if let (Some(base), Value::Object(extra)) = (config.as_object_mut(), extra) {
        base.extend(extra);
    }
    serde_json::from_value(config).expect("Invalid stack config fixture")
}

/// An output reference in stack-file form
pub fn output_ref(stack: &str, output: &str) -> Value {
    json!({ "stack": stack, "output": output })
}

/// A template with one queue and no local references
pub const PLAIN_TEMPLATE: &str = r#"AWSTemplateFormatVersion: "2010-09-09"
Parameters:
  Env:
    Type: String
    Default: dev
Resources:
  Queue:
    Type: AWS::SQS::Queue
Outputs:
  QueueUrl:
    Value: !Ref Queue
"#;

/// A function whose code lives next to the template
pub const FUNCTION_TEMPLATE: &str = r#"AWSTemplateFormatVersion: "2010-09-09"
Transform: AWS::Serverless-2016-10-31
Resources:
  Handler:
    Type: AWS::Serverless::Function
    Properties:
      CodeUri: ./src
      Handler: index.handler
      Runtime: nodejs20.x
  Child:
    Type: AWS::CloudFormation::Stack
    Properties:
      TemplateURL: ./child.yaml
"#;

/// Nested template referenced by [`FUNCTION_TEMPLATE`]
pub const CHILD_TEMPLATE: &str = r#"Resources:
  Worker:
    Type: AWS::Lambda::Function
    Properties:
      Code: ./worker
      Handler: main.handler
      Runtime: python3.12
      Role: !GetAtt Role.Arn
  Role:
    Type: AWS::IAM::Role
"#;

/// A template tree with a function, a nested stack and its code
pub fn function_tree() -> TemplateTree {
    let tree = TemplateTree::new();
    tree.file("template.yaml", FUNCTION_TEMPLATE);
    tree.file("child.yaml", CHILD_TEMPLATE);
    tree.file("src/index.js", "exports.handler = async () => 'ok';\n");
    tree.file("worker/main.py", "def handler(event, context):\n    return 'ok'\n");
    tree
}
