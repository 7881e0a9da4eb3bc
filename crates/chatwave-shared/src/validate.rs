//! Field rules shared by every entry point that creates or patches records.

use crate::constants::{
    MAX_BIO_LEN, MAX_DESCRIPTION_LEN, MAX_MESSAGE_LEN, MIN_GROUP_NAME_LEN, MIN_USER_NAME_LEN,
    PLACEHOLDER_AVATAR_BASE,
};
use crate::error::ChatError;

pub fn user_name(name: &str) -> Result<String, ChatError> {
    let name = name.trim();
    if name.chars().count() < MIN_USER_NAME_LEN {
        return Err(ChatError::invalid(format!(
            "Name must be at least {MIN_USER_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

pub fn bio(bio: &str) -> Result<String, ChatError> {
    let bio = bio.trim();
    if bio.chars().count() > MAX_BIO_LEN {
        return Err(ChatError::invalid(format!(
            "Bio cannot be longer than {MAX_BIO_LEN} characters"
        )));
    }
    Ok(bio.to_string())
}

pub fn group_name(name: &str) -> Result<String, ChatError> {
    let name = name.trim();
    if name.chars().count() < MIN_GROUP_NAME_LEN {
        return Err(ChatError::invalid(format!(
            "Group name must be at least {MIN_GROUP_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

/// Empty descriptions are stored as absent.
pub fn description(description: &str) -> Result<Option<String>, ChatError> {
    let description = description.trim();
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ChatError::invalid(format!(
            "Description cannot be longer than {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok((!description.is_empty()).then(|| description.to_string()))
}

/// Trimmed message text, `None` when blank.
pub fn message_content(content: Option<&str>) -> Result<Option<String>, ChatError> {
    let Some(content) = content.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    if content.chars().count() > MAX_MESSAGE_LEN {
        return Err(ChatError::invalid(format!(
            "Message cannot be longer than {MAX_MESSAGE_LEN} characters"
        )));
    }
    Ok(Some(content.to_string()))
}

/// Lettered placeholder avatar for a record created without one.
pub fn default_avatar(name: &str) -> String {
    let letter = name
        .trim()
        .chars()
        .next()
        .map(|c| c.to_uppercase().to_string())
        .unwrap_or_else(|| "U".to_string());
    format!("{PLACEHOLDER_AVATAR_BASE}{letter}")
}
