//! Parsing of the text lists that accompany a generation run.
//!
//! The ignore list names build files that must not be part of the
//! manifest. The attribute list assigns per file flags and install tags.
//! Both are keyed by build relative paths, compared case insensitively.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs,
    path::Path,
};

use tracing::warn;

use crate::{lib_error_handling::BuildPatchError, utils::normalize_build_path};

/// Attributes applied to a file entry of the manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub read_only: bool,
    pub compressed: bool,
    pub unix_executable: bool,
    pub install_tags: BTreeSet<String>,
}

/// Parses ignore list text.
///
/// One build relative path per line. Anything after a tab is ignored, as
/// some tools append a timestamp. Blank lines are skipped.
pub fn parse_ignore_list(text: &str) -> HashSet<String> {
    text.lines()
        .filter_map(|line| {
            let path = line.split('\t').next().unwrap_or_default().trim();
            (!path.is_empty()).then(|| normalize_build_path(path))
        })
        .collect()
}

pub fn load_ignore_list(path: &Path) -> Result<HashSet<String>, BuildPatchError> {
    Ok(parse_ignore_list(&fs::read_to_string(path)?))
}

/// Parses attribute list text.
///
/// Each line starts with a quoted build relative path followed by any
/// number of keywords: `readonly`, `compressed`, `executable` and
/// `tag:<name>`. A file listed on more than one line gets the union of
/// all its attributes.
pub fn parse_attribute_list(text: &str) -> Result<HashMap<String, FileAttributes>, BuildPatchError> {
    let mut attributes: HashMap<String, FileAttributes> = HashMap::new();

    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let malformed = || {
            BuildPatchError::InvalidListError(format!(
                "Attribute list line {} is malformed: {line}",
                line_number + 1
            ))
        };

        let rest = line.strip_prefix('"').ok_or_else(malformed)?;
        let (path, keywords) = rest.split_once('"').ok_or_else(malformed)?;
        if path.trim().is_empty() {
            return Err(malformed());
        }

        let entry = attributes.entry(normalize_build_path(path)).or_default();
        for keyword in keywords.split_whitespace() {
            match keyword.to_lowercase().as_str() {
                "readonly" => entry.read_only = true,
                "compressed" => entry.compressed = true,
                "executable" => entry.unix_executable = true,
                other => match other.strip_prefix("tag:") {
                    Some(tag) if !tag.is_empty() => {
                        //Tags keep the case they were written in.
                        entry.install_tags.insert(keyword[4..].to_string());
                    }
                    _ => warn!(
                        "Unknown attribute \"{keyword}\" on line {} ignored.",
                        line_number + 1
                    ),
                },
            }
        }
    }

    Ok(attributes)
}

pub fn load_attribute_list(path: &Path) -> Result<HashMap<String, FileAttributes>, BuildPatchError> {
    parse_attribute_list(&fs::read_to_string(path)?)
}
