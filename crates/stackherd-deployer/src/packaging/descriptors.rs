//! Resource properties that point at packageable artifacts
//!
//! Each [`PropertyDescriptor`] names one `(resource type, property path)`
//! pair together with a [`LocationCodec`] that knows the shape of the value
//! found there. The codec answers three questions about a value: which local
//! paths it references, which already-packaged S3 objects it references, and
//! how to rewrite it once its local path has been packaged.

use serde_yaml::{Mapping, Value};

use super::PackagingError;
use super::file::{Archive, Destination, PackagedLocation};

/// A bucket and key referenced by a deployed template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

/// Value shape of one packageable property
pub trait LocationCodec: Send + Sync {
    /// Local paths referenced by `value`, as written.
    fn candidates(&self, value: &Value) -> Vec<String> {
        local_path(value).into_iter().collect()
    }

    /// S3 objects `value` already points at.
    fn packaged_locations(&self, value: &Value) -> Vec<ObjectRef>;

    /// Replace `value` with a reference to `location`.
    fn rewrite(&self, value: &mut Value, location: &PackagedLocation) -> Result<(), PackagingError>;
}

/// Check whether a template string is a path on the local disk.
pub fn is_local_path(s: &str) -> bool {
    !s.is_empty() && !s.contains("://") && !s.starts_with("arn:") && !s.contains("${")
}

fn local_path(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| is_local_path(s))
        .map(str::to_string)
}

/// Image and inline properties normally hold an image name or code, so only
/// explicitly relative or absolute paths count as local.
fn explicit_path(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.contains('\n'))
        .filter(|s| s.starts_with("./") || s.starts_with("../") || s.starts_with('/'))
        .map(str::to_string)
}

fn expect_s3<'a>(
    location: &'a PackagedLocation,
    codec: &'static str,
) -> Result<&'a super::file::S3Location, PackagingError> {
    match location {
        PackagedLocation::S3(s3) => Ok(s3),
        other => Err(PackagingError::UnexpectedLocation {
            codec,
            location: format!("{other:?}"),
        }),
    }
}

/// Parse `s3://bucket/key`.
pub fn parse_s3_url(url: &str) -> Option<ObjectRef> {
    let (bucket, key) = url.strip_prefix("s3://")?.split_once('/')?;
    (!bucket.is_empty() && !key.is_empty()).then(|| ObjectRef::new(bucket, key))
}

/// Parse virtual-hosted and path-style S3 https URLs.
pub fn parse_https_url(url: &str) -> Option<ObjectRef> {
    let rest = url.strip_prefix("https://")?;
    let (host, path) = rest.split_once('/')?;
    if let Some((bucket, _)) = host.split_once(".s3.") {
        return (!path.is_empty()).then(|| ObjectRef::new(bucket, path));
    }
    if let Some(bucket) = host.strip_suffix(".s3.amazonaws.com") {
        return (!path.is_empty()).then(|| ObjectRef::new(bucket, path));
    }
    if host.starts_with("s3.") || host.starts_with("s3-") {
        let (bucket, key) = path.split_once('/')?;
        return (!key.is_empty()).then(|| ObjectRef::new(bucket, key));
    }
    None
}

/// A template URL string
pub struct HttpsUrl;

impl LocationCodec for HttpsUrl {
    fn packaged_locations(&self, value: &Value) -> Vec<ObjectRef> {
        value.as_str().and_then(parse_https_url).into_iter().collect()
    }

    fn rewrite(
        &self,
        value: &mut Value,
        location: &PackagedLocation,
    ) -> Result<(), PackagingError> {
        *value = Value::String(expect_s3(location, "HttpsUrl")?.https_url());
        Ok(())
    }
}

/// An `s3://bucket/key` string, or its `{Bucket, Key}` object form
pub struct S3Url;

impl LocationCodec for S3Url {
    fn packaged_locations(&self, value: &Value) -> Vec<ObjectRef> {
        if let Some(found) = value.as_str().and_then(parse_s3_url) {
            return vec![found];
        }
        match (
            value.get("Bucket").and_then(Value::as_str),
            value.get("Key").and_then(Value::as_str),
        ) {
            (Some(bucket), Some(key)) => vec![ObjectRef::new(bucket, key)],
            _ => Vec::new(),
        }
    }

    fn rewrite(
        &self,
        value: &mut Value,
        location: &PackagedLocation,
    ) -> Result<(), PackagingError> {
        *value = Value::String(expect_s3(location, "S3Url")?.s3_url());
        Ok(())
    }
}

/// An object with separate bucket and key fields
pub struct S3BucketKey {
    pub bucket_field: &'static str,
    pub key_field: &'static str,
}

impl LocationCodec for S3BucketKey {
    fn packaged_locations(&self, value: &Value) -> Vec<ObjectRef> {
        match (
            value.get(self.bucket_field).and_then(Value::as_str),
            value.get(self.key_field).and_then(Value::as_str),
        ) {
            (Some(bucket), Some(key)) => vec![ObjectRef::new(bucket, key)],
            _ => Vec::new(),
        }
    }

    fn rewrite(
        &self,
        value: &mut Value,
        location: &PackagedLocation,
    ) -> Result<(), PackagingError> {
        let s3 = expect_s3(location, "S3BucketKey")?;
        let mut mapping = Mapping::new();
        mapping.insert(
            Value::String(self.bucket_field.to_string()),
            Value::String(s3.bucket.clone()),
        );
        mapping.insert(
            Value::String(self.key_field.to_string()),
            Value::String(s3.key.clone()),
        );
        *value = Value::Mapping(mapping);
        Ok(())
    }
}

/// A container image reference
pub struct Image;

impl LocationCodec for Image {
    fn candidates(&self, value: &Value) -> Vec<String> {
        explicit_path(value).into_iter().collect()
    }

    fn packaged_locations(&self, _value: &Value) -> Vec<ObjectRef> {
        Vec::new()
    }

    fn rewrite(
        &self,
        value: &mut Value,
        location: &PackagedLocation,
    ) -> Result<(), PackagingError> {
        match location {
            PackagedLocation::Image { uri } => {
                *value = Value::String(uri.clone());
                Ok(())
            }
            other => Err(PackagingError::UnexpectedLocation {
                codec: "Image",
                location: format!("{other:?}"),
            }),
        }
    }
}

/// Source code inlined into the template
pub struct Inline;

impl LocationCodec for Inline {
    fn candidates(&self, value: &Value) -> Vec<String> {
        explicit_path(value).into_iter().collect()
    }

    fn packaged_locations(&self, _value: &Value) -> Vec<ObjectRef> {
        Vec::new()
    }

    fn rewrite(
        &self,
        value: &mut Value,
        location: &PackagedLocation,
    ) -> Result<(), PackagingError> {
        match location {
            PackagedLocation::Inline { body, .. } => {
                *value = Value::String(body.clone());
                Ok(())
            }
            other => Err(PackagingError::UnexpectedLocation {
                codec: "Inline",
                location: format!("{other:?}"),
            }),
        }
    }
}

/// One packageable property
pub struct PropertyDescriptor {
    pub resource_type: &'static str,
    /// Dotted path below `Properties`; `*` walks every sequence element
    pub property: &'static str,
    pub destination: Destination,
    pub archive: Archive,
    /// The referenced file is itself a template to package
    pub nested_template: bool,
    pub codec: &'static dyn LocationCodec,
}

impl std::fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("resource_type", &self.resource_type)
            .field("property", &self.property)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

const CODE: S3BucketKey = S3BucketKey {
    bucket_field: "S3Bucket",
    key_field: "S3Key",
};

const BUCKET_KEY: S3BucketKey = S3BucketKey {
    bucket_field: "Bucket",
    key_field: "Key",
};

macro_rules! descriptor {
    ($ty:literal, $prop:literal, $dest:ident, $archive:ident, $codec:expr $(,)?) => {
        descriptor!($ty, $prop, $dest, $archive, $codec, false)
    };
    ($ty:literal, $prop:literal, $dest:ident, $archive:ident, $codec:expr, $nested:literal $(,)?) => {
        PropertyDescriptor {
            resource_type: $ty,
            property: $prop,
            destination: Destination::$dest,
            archive: Archive::$archive,
            nested_template: $nested,
            codec: &$codec,
        }
    };
}

static DESCRIPTORS: &[PropertyDescriptor] = &[
    descriptor!("AWS::CloudFormation::Stack", "TemplateURL", ObjectStorage, Never, HttpsUrl, true),
    descriptor!("AWS::Serverless::Application", "Location", ObjectStorage, Never, HttpsUrl, true),
    descriptor!("AWS::Lambda::Function", "Code", ObjectStorage, Always, CODE),
    descriptor!("AWS::Lambda::Function", "Code.ImageUri", ContainerRegistry, Never, Image),
    descriptor!("AWS::Lambda::Function", "Code.ZipFile", Inline, Never, Inline),
    descriptor!("AWS::Lambda::LayerVersion", "Content", ObjectStorage, Always, CODE),
    descriptor!("AWS::Serverless::Function", "CodeUri", ObjectStorage, Always, S3Url),
    descriptor!("AWS::Serverless::Function", "ImageUri", ContainerRegistry, Never, Image),
    descriptor!("AWS::Serverless::Function", "InlineCode", Inline, Never, Inline),
    descriptor!("AWS::Serverless::LayerVersion", "ContentUri", ObjectStorage, Always, S3Url),
    descriptor!("AWS::Serverless::Api", "DefinitionUri", ObjectStorage, Never, S3Url),
    descriptor!("AWS::Serverless::HttpApi", "DefinitionUri", ObjectStorage, Never, S3Url),
    descriptor!("AWS::Serverless::StateMachine", "DefinitionUri", ObjectStorage, Never, S3Url),
    descriptor!("AWS::ApiGateway::RestApi", "BodyS3Location", ObjectStorage, Never, BUCKET_KEY),
    descriptor!(
        "AWS::StepFunctions::StateMachine",
        "DefinitionS3Location",
        ObjectStorage,
        Never,
        BUCKET_KEY,
    ),
    descriptor!("AWS::AppSync::GraphQLSchema", "DefinitionS3Location", ObjectStorage, Never, S3Url),
    descriptor!(
        "AWS::AppSync::Resolver",
        "RequestMappingTemplateS3Location",
        ObjectStorage,
        Never,
        S3Url,
    ),
    descriptor!(
        "AWS::AppSync::Resolver",
        "ResponseMappingTemplateS3Location",
        ObjectStorage,
        Never,
        S3Url,
    ),
    descriptor!("AWS::Glue::Job", "Command.ScriptLocation", ObjectStorage, Never, S3Url),
    descriptor!(
        "AWS::ElasticBeanstalk::ApplicationVersion",
        "SourceBundle",
        ObjectStorage,
        Always,
        CODE,
    ),
    descriptor!(
        "AWS::ECS::TaskDefinition",
        "ContainerDefinitions.*.Image",
        ContainerRegistry,
        Never,
        Image,
    ),
];

/// Every packageable property
pub fn descriptors() -> &'static [PropertyDescriptor] {
    DESCRIPTORS
}

/// Packageable properties of one resource type
pub fn for_resource_type(
    resource_type: &str,
) -> impl Iterator<Item = &'static PropertyDescriptor> + '_ {
    DESCRIPTORS
        .iter()
        .filter(move |d| d.resource_type == resource_type)
}
