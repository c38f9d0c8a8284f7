//! Validation of create and update intents.
//!
//! The same rules run on the device before anything is queued and on the
//! server before anything is stored, so an intent accepted locally is never
//! rejected remotely for its shape.

use crate::{error::Result, Error, NewRecord, RecordPatch};

/// Fields every post must carry.
pub const REQUIRED_FIELDS: [&str; 3] = ["title", "content", "author"];

/// Check that every required field of a create intent is non-empty.
pub fn validate_new(input: &NewRecord) -> Result<()> {
    let missing: Vec<&str> = [
        ("title", input.title.as_str()),
        ("content", input.content.as_str()),
        ("author", input.author.as_str()),
    ]
    .into_iter()
    .filter(|(_, value)| value.is_empty())
    .map(|(name, _)| name)
    .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

/// Drop empty fields from a patch and require that something remains.
pub fn normalize_patch(patch: RecordPatch) -> Result<RecordPatch> {
    let keep = |value: Option<String>| value.filter(|v| !v.is_empty());
    let patch = RecordPatch {
        title: keep(patch.title),
        content: keep(patch.content),
        author: keep(patch.author),
    };

    if patch.is_empty() {
        return Err(Error::Validation(format!(
            "at least one field ({}) must be provided",
            REQUIRED_FIELDS.join(", ")
        )));
    }
    Ok(patch)
}
