//! vCard 3.0 payload assembly.
//!
//! Only the handful of properties a business card needs are written, one line each, in a fixed
//! order. Values are written verbatim: commas, semicolons, backslashes and newlines are not
//! escaped, so a value containing them will not survive a strict vCard reader.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reduce::EncodedImage;

const LINE_BREAK: &str = "\n";

/// A digital business card as stored for one account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactProfile {
    #[serde(rename = "name")]
    pub display_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// `data:image/...;base64,...` URL as uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_logo: Option<String>,
}

impl ContactProfile {
    pub fn new(display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            email: email.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VCardError {
    #[error("vCard must start with BEGIN:VCARD")]
    MissingBegin,
    #[error("vCard must end with END:VCARD")]
    MissingEnd,
    #[error("malformed vCard line: {0}")]
    MalformedLine(String),
}

/// Property values read back from a vCard produced by this module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedCard {
    pub version: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub website: Option<String>,
    pub profile_url: Option<String>,
    pub note: Option<String>,
    /// Base64 payload and declared `TYPE` parameter.
    pub photo: Option<(String, String)>,
    pub logo: Option<(String, String)>,
}

struct Builder {
    lines: Vec<String>,
}

impl Builder {
    fn new() -> Self {
        Self {
            lines: vec!["BEGIN:VCARD".to_string(), "VERSION:3.0".to_string()],
        }
    }

    /// Appends `NAME:value` unless the value is missing or blank.
    fn field(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            self.lines.push(format!("{name}:{value}"));
        }
        self
    }

    fn image(&mut self, name: &str, image: Option<&EncodedImage>) -> &mut Self {
        if let Some(image) = image {
            self.lines.push(format!(
                "{name};ENCODING=b;TYPE={}:{}",
                image.vcard_type(),
                image.to_base64()
            ));
        }
        self
    }

    fn text_fields(&mut self, profile: &ContactProfile) -> &mut Self {
        self.field("FN", Some(&profile.display_name))
            .field("EMAIL", Some(&profile.email))
            .field("TEL", profile.phone.as_deref())
            .field("ORG", profile.company.as_deref())
            .field("TITLE", profile.title.as_deref())
            .field("URL", profile.website.as_deref())
    }

    fn finish(&mut self) -> String {
        self.lines.push("END:VCARD".to_string());
        self.lines.join(LINE_BREAK)
    }
}

/// Builds the full card: text fields followed by the optional embedded photo and logo.
///
/// # Example
///
/// ```rust
/// use qircard::vcard::{assemble, ContactProfile};
///
/// let card = assemble(&ContactProfile::new("Ada Lovelace", "ada@example.com"), None, None);
/// assert_eq!(
///     card,
///     "BEGIN:VCARD\nVERSION:3.0\nFN:Ada Lovelace\nEMAIL:ada@example.com\nEND:VCARD"
/// );
/// ```
pub fn assemble(
    profile: &ContactProfile,
    photo: Option<&EncodedImage>,
    logo: Option<&EncodedImage>,
) -> String {
    Builder::new()
        .text_fields(profile)
        .image("PHOTO", photo)
        .image("LOGO", logo)
        .finish()
}

/// Builds the reduced card used when the full one does not fit in a QR symbol: no images,
/// plus a link to the hosted profile where the photo can be seen.
pub fn assemble_simple(profile: &ContactProfile, profile_url: &str) -> String {
    let note = format!("View full profile with photo at: {profile_url}");
    Builder::new()
        .text_fields(profile)
        .field("URL;TYPE=PROFILE", Some(profile_url))
        .field("NOTE", Some(&note))
        .finish()
}

/// Reads back a card written by [`assemble`] or [`assemble_simple`].
///
/// Unknown properties are ignored. When a property appears more than once the first value wins.
pub fn parse(text: &str) -> Result<ParsedCard, VCardError> {
    let lines: Vec<&str> = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .collect();

    match lines.first() {
        Some(first) if first.eq_ignore_ascii_case("BEGIN:VCARD") => {}
        _ => return Err(VCardError::MissingBegin),
    }
    match lines.last() {
        Some(last) if lines.len() > 1 && last.eq_ignore_ascii_case("END:VCARD") => {}
        _ => return Err(VCardError::MissingEnd),
    }

    let mut card = ParsedCard::default();
    for line in &lines[1..lines.len() - 1] {
        let (head, value) = line
            .split_once(':')
            .ok_or_else(|| VCardError::MalformedLine(line.to_string()))?;
        let mut parts = head.split(';');
        let name = parts.next().unwrap_or_default().to_ascii_uppercase();
        let params: Vec<String> = parts.map(|p| p.to_ascii_uppercase()).collect();
        let value = value.to_string();

        let slot = match name.as_str() {
            "VERSION" => &mut card.version,
            "FN" => &mut card.display_name,
            "EMAIL" => &mut card.email,
            "TEL" => &mut card.phone,
            "ORG" => &mut card.company,
            "TITLE" => &mut card.title,
            "NOTE" => &mut card.note,
            "URL" if params.iter().any(|p| p == "TYPE=PROFILE") => &mut card.profile_url,
            "URL" => &mut card.website,
            "PHOTO" | "LOGO" => {
                let kind = params
                    .iter()
                    .find_map(|p| p.strip_prefix("TYPE="))
                    .unwrap_or_default()
                    .to_string();
                let target = if name == "PHOTO" {
                    &mut card.photo
                } else {
                    &mut card.logo
                };
                target.get_or_insert((value, kind));
                continue;
            }
            _ => continue,
        };
        slot.get_or_insert(value);
    }

    Ok(card)
}
