//! Template documents and the packageable properties inside them
//!
//! Templates are held as a `serde_yaml::Value` whatever their source format,
//! so short-form intrinsics such as `!Ref` survive a YAML round trip. JSON
//! templates are parsed with `serde_json` and written back as JSON.

use std::path::{Path, PathBuf};

use serde_yaml::Value;

use super::PackagingError;
use super::descriptors::{self, ObjectRef, PropertyDescriptor};
use super::file::PackagedLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Json,
    Yaml,
}

impl TemplateFormat {
    /// Pick the format from the file extension, falling back to the body.
    pub fn detect(path: &Path, body: &str) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            Some("yaml" | "yml") => Self::Yaml,
            _ if body.trim_start().starts_with('{') => Self::Json,
            _ => Self::Yaml,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

/// A local path found in a packageable property
#[derive(Debug, Clone)]
pub struct Reference {
    pub logical_id: String,
    pub resource_type: String,
    pub descriptor: &'static PropertyDescriptor,
    /// The path as written in the template
    pub raw: String,
}

/// A parsed template
#[derive(Debug, Clone)]
pub struct Template {
    pub path: PathBuf,
    pub format: TemplateFormat,
    body: Value,
}

impl Template {
    pub fn parse(path: &Path, body: &str) -> Result<Self, PackagingError> {
        let format = TemplateFormat::detect(path, body);
        let invalid = |message: String| PackagingError::Template {
            path: path.to_path_buf(),
            message,
        };
        let body = match format {
            TemplateFormat::Json => {
                let json: serde_json::Value =
                    serde_json::from_str(body).map_err(|e| invalid(e.to_string()))?;
                serde_yaml::to_value(json).map_err(|e| invalid(e.to_string()))?
            }
            TemplateFormat::Yaml => {
                serde_yaml::from_str(body).map_err(|e| invalid(e.to_string()))?
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            format,
            body,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, PackagingError> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PackagingError::Template {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::parse(path, &body)
    }

    pub fn render(&self) -> Result<String, PackagingError> {
        let rendered = match self.format {
            TemplateFormat::Json => {
                serde_json::to_string_pretty(&self.body).map_err(|e| e.to_string())
            }
            TemplateFormat::Yaml => serde_yaml::to_string(&self.body).map_err(|e| e.to_string()),
        };
        rendered.map_err(|message| PackagingError::Template {
            path: self.path.clone(),
            message,
        })
    }

    /// Every local path referenced from a packageable property.
    pub fn references(&self) -> Vec<Reference> {
        let mut found = Vec::new();
        for (logical_id, resource_type, properties) in resources(&self.body) {
            for descriptor in descriptors::for_resource_type(resource_type) {
                let mut values = Vec::new();
                visit_path(properties, &segments(descriptor), &mut values);
                for value in values {
                    for raw in descriptor.codec.candidates(value) {
                        found.push(Reference {
                            logical_id: logical_id.to_string(),
                            resource_type: resource_type.to_string(),
                            descriptor,
                            raw,
                        });
                    }
                }
            }
        }
        found
    }

    /// Every S3 object the template already points at.
    pub fn packaged_objects(&self) -> Vec<ObjectRef> {
        let mut found = Vec::new();
        for (_, resource_type, properties) in resources(&self.body) {
            for descriptor in descriptors::for_resource_type(resource_type) {
                let mut values = Vec::new();
                visit_path(properties, &segments(descriptor), &mut values);
                for value in values {
                    found.extend(descriptor.codec.packaged_locations(value));
                }
            }
        }
        found
    }

    /// Rewrite every reference that `lookup` resolves. Returns how many
    /// values changed.
    pub fn rewrite<F>(&mut self, mut lookup: F) -> Result<usize, PackagingError>
    where
        F: FnMut(&str) -> Option<PackagedLocation>,
    {
        let mut rewritten = 0;
        let Some(resources) = self.body.get_mut("Resources").and_then(Value::as_mapping_mut)
        else {
            return Ok(0);
        };
        for (_, resource) in resources.iter_mut() {
            let Some(resource_type) = resource.get("Type").and_then(Value::as_str) else {
                continue;
            };
            let resource_type = resource_type.to_string();
            let Some(properties) = resource.get_mut("Properties") else {
                continue;
            };
            for descriptor in descriptors::for_resource_type(&resource_type) {
                let mut result = Ok(());
                visit_path_mut(properties, &segments(descriptor), &mut |value| {
                    if result.is_err() {
                        return;
                    }
                    let Some(raw) = descriptor.codec.candidates(value).into_iter().next() else {
                        return;
                    };
                    if let Some(location) = lookup(&raw) {
                        result = descriptor.codec.rewrite(value, &location);
                        rewritten += 1;
                    }
                });
                result?;
            }
        }
        Ok(rewritten)
    }
}

fn segments(descriptor: &PropertyDescriptor) -> Vec<&'static str> {
    descriptor.property.split('.').collect()
}

fn resources(body: &Value) -> impl Iterator<Item = (&str, &str, &Value)> {
    body.get("Resources")
        .and_then(Value::as_mapping)
        .into_iter()
        .flat_map(|m| m.iter())
        .filter_map(|(id, resource)| {
            Some((
                id.as_str()?,
                resource.get("Type")?.as_str()?,
                resource.get("Properties")?,
            ))
        })
}

fn visit_path<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    match segments.split_first() {
        None => out.push(value),
        Some((&"*", rest)) => {
            for item in value.as_sequence().into_iter().flatten() {
                visit_path(item, rest, out);
            }
        }
        Some((segment, rest)) => {
            if let Some(next) = value.get(*segment) {
                visit_path(next, rest, out);
            }
        }
    }
}

fn visit_path_mut(value: &mut Value, segments: &[&str], f: &mut dyn FnMut(&mut Value)) {
    match segments.split_first() {
        None => f(value),
        Some((&"*", rest)) => {
            if let Some(items) = value.as_sequence_mut() {
                for item in items {
                    visit_path_mut(item, rest, f);
                }
            }
        }
        Some((segment, rest)) => {
            if let Some(next) = value.get_mut(*segment) {
                visit_path_mut(next, rest, f);
            }
        }
    }
}
