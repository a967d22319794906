// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use std::path::{Component, Path};

/// Splits an absolute namespace path into its components, root excluded.
///
/// `"/"` yields an empty list. `.` components are dropped; `..` and
/// relative paths are rejected since the walk always starts at the root.
pub fn components(path: &str) -> Result<Vec<String>> {
    let mut parts = Path::new(path).components();
    match parts.next() {
        Some(Component::RootDir) => {}
        _ => return Err(Error::invalid_request(format!("path '{path}' is not absolute"))),
    }

    let mut names = Vec::new();
    for component in parts {
        match component {
            Component::Normal(name) => match name.to_str() {
                Some(name) => names.push(name.to_string()),
                None => {
                    return Err(Error::invalid_request(format!(
                        "path '{path}' has a non UTF-8 component"
                    )));
                }
            },
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::invalid_request(format!(
                    "path '{path}' contains '..'"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::invalid_request(format!("path '{path}' is malformed")));
            }
        }
    }
    Ok(names)
}

/// Number of nodes a fully resolved path chain holds, root included.
pub fn depth(path: &str) -> Result<usize> {
    Ok(components(path)?.len() + 1)
}

/// Extracts the final component of a path, if any.
pub fn basename(path: &str) -> Option<String> {
    components(path).ok()?.pop()
}

/// Parent of an absolute path; `None` for the root.
pub fn dirname(path: &str) -> Option<String> {
    let mut names = components(path).ok()?;
    names.pop()?;
    Some(format!("/{}", names.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components() {
        assert_eq!(components("/").unwrap(), Vec::<String>::new());
        assert_eq!(components("/a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(components("/a//b/./c/").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_components_rejects_relative_and_parent() {
        assert!(components("a/b").unwrap_err().is_contract_violation());
        assert!(components("/a/../b").unwrap_err().is_contract_violation());
        assert!(components("").is_err());
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth("/").unwrap(), 1);
        assert_eq!(depth("/a/b").unwrap(), 3);
    }

    #[test]
    fn test_basename_dirname() {
        assert_eq!(basename("/a/b/c"), Some("c".to_string()));
        assert_eq!(basename("/"), None);
        assert_eq!(dirname("/a/b/c"), Some("/a/b".to_string()));
        assert_eq!(dirname("/a"), Some("/".to_string()));
        assert_eq!(dirname("/"), None);
    }
}
