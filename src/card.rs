//! QR card generation with capacity fallback.
//!
//! A card is first encoded in its full form, with the reduced photo and logo embedded. If the
//! symbol cannot hold it, the images are dropped and a simple card pointing at the hosted
//! profile is encoded instead. If even that does not fit the request fails.
//!
//! ```text
//! Full --encode ok--> Encoded(Full)
//!   |
//!   capacity exceeded
//!   v
//! Simple --encode ok--> Encoded(Simple)
//!   |
//!   capacity exceeded
//!   v
//! Failed
//! ```
//!
//! Only a capacity error moves the machine forward. Any other renderer failure is returned as is.
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    qr::{ErrorCorrection, QrError, QrMatrix, QrRenderer},
    reduce::{reduce_data_url, EncodedImage, ReduceError},
    store::AccountId,
    vcard::{self, ContactProfile},
};

/// Which payload ended up in the symbol.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadTier {
    Full,
    Simple,
}

#[derive(Debug)]
pub struct GeneratedCard {
    pub tier: PayloadTier,
    pub vcard: String,
    pub qr: QrMatrix,
}

#[derive(Debug, Error)]
pub enum CardError {
    #[error("invalid image: {0}")]
    Image(#[from] ReduceError),

    #[error("contact card of {len} bytes does not fit in a QR code even without images")]
    CapacityExceeded { len: usize },

    #[error(transparent)]
    Qr(QrError),
}

/// Public address of a profile's contact page.
pub fn profile_url(base_url: &str, id: &AccountId) -> String {
    format!("{}/contact/{}", base_url.trim_end_matches('/'), id)
}

/// Reduces an optional stored image; blank values count as absent.
pub fn reduce_optional(image: Option<&str>) -> Result<Option<EncodedImage>, ReduceError> {
    image
        .filter(|url| !url.trim().is_empty())
        .map(reduce_data_url)
        .transpose()
}

/// A profile's photo and logo after reduction, ready to embed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CardImages {
    pub photo: Option<EncodedImage>,
    pub logo: Option<EncodedImage>,
}

impl CardImages {
    /// Decodes and reduces both images. Fails on the first one that cannot be reduced, so a
    /// profile that passes here is safe to store.
    ///
    /// CPU-bound; call this from a blocking context inside async code.
    pub fn reduce(profile: &ContactProfile) -> Result<Self, CardError> {
        Ok(Self {
            photo: reduce_optional(profile.profile_image.as_deref())?,
            logo: reduce_optional(profile.company_logo.as_deref())?,
        })
    }
}

/// Builds the vCard for `profile` and encodes it, falling back to the simple card when the
/// full one exceeds the symbol capacity at `ecc`.
///
/// Image reduction is CPU-bound; call this from a blocking context inside async code.
pub fn generate(
    renderer: &dyn QrRenderer,
    ecc: ErrorCorrection,
    profile: &ContactProfile,
    profile_url: &str,
) -> Result<GeneratedCard, CardError> {
    let images = CardImages::reduce(profile)?;
    generate_with_images(renderer, ecc, profile, &images, profile_url)
}

/// Same as [`generate`] with images that were already reduced.
pub fn generate_with_images(
    renderer: &dyn QrRenderer,
    ecc: ErrorCorrection,
    profile: &ContactProfile,
    images: &CardImages,
    profile_url: &str,
) -> Result<GeneratedCard, CardError> {
    let full = vcard::assemble(profile, images.photo.as_ref(), images.logo.as_ref());
    encode_with_fallback(renderer, ecc, full, || {
        vcard::assemble_simple(profile, profile_url)
    })
}

/// Runs the Full → Simple → Failed state machine over two prepared payloads.
/// The simple payload is only built if the full one does not fit.
pub fn encode_with_fallback<F>(
    renderer: &dyn QrRenderer,
    ecc: ErrorCorrection,
    full: String,
    simple: F,
) -> Result<GeneratedCard, CardError>
where
    F: FnOnce() -> String,
{
    debug!(len = full.len(), %ecc, "Encoding full card");
    match renderer.encode(&full, ecc) {
        Ok(qr) => {
            return Ok(GeneratedCard {
                tier: PayloadTier::Full,
                vcard: full,
                qr,
            })
        }
        Err(e) if e.is_capacity() => {
            warn!(len = full.len(), %ecc, "Full card exceeds QR capacity, falling back to simple card");
        }
        Err(e) => return Err(CardError::Qr(e)),
    }

    let simple = simple();
    debug!(len = simple.len(), %ecc, "Encoding simple card");
    match renderer.encode(&simple, ecc) {
        Ok(qr) => Ok(GeneratedCard {
            tier: PayloadTier::Simple,
            vcard: simple,
            qr,
        }),
        Err(e) if e.is_capacity() => {
            warn!(len = simple.len(), %ecc, "Simple card exceeds QR capacity");
            Err(CardError::CapacityExceeded { len: simple.len() })
        }
        Err(e) => Err(CardError::Qr(e)),
    }
}
