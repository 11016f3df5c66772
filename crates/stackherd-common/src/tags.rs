//! Tag schema for stackherd-managed resources
//!
//! Every stack is deployed with a `RootStackName` tag. CloudFormation
//! propagates stack tags to every taggable resource, including those of
//! nested stacks, which is what makes retained resources discoverable after
//! their stack is gone.
//!
//! Packaged S3 objects carry the stack tags too. Because one object can be
//! shared by several stacks, tag values are merged into a `+`-joined set.
//!
//! ## Tag Schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `RootStackName` | Name of the top-level stack owning the resource |
//! | user tags | Copied from the stack definition |

use std::collections::BTreeMap;

/// Tag key naming the root stack that owns a resource
pub const TAG_ROOT_STACK_NAME: &str = "RootStackName";

/// Delimiter joining the values of a multi-valued object tag
pub const TAG_VALUE_DELIMITER: char = '+';

/// Split a merged tag value into its members.
pub fn split_values(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(TAG_VALUE_DELIMITER)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Check whether a merged tag value contains `member`.
pub fn contains_value(value: &str, member: &str) -> bool {
    split_values(value).any(|v| v == member)
}

/// Merge `incoming` tags into `existing`, accumulating values per key.
///
/// Values already present are not duplicated and member order is preserved,
/// so re-tagging an object with the same stack is a no-op.
pub fn merge_tags(
    existing: &BTreeMap<String, String>,
    incoming: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = existing.clone();
    for (key, value) in incoming {
        match merged.get_mut(key) {
            Some(current) => {
                for member in split_values(value) {
                    if !contains_value(current, member) {
                        if !current.is_empty() {
                            current.push(TAG_VALUE_DELIMITER);
                        }
                        current.push_str(member);
                    }
                }
            }
            None => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
