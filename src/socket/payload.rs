//! Bytes written to a client for one fetched secret.

use zeroize::Zeroizing;

use crate::store::{FieldError, KvSecret};

/// Render the response for `secret`.
///
/// With a field, the payload is that field's string value, verbatim and
/// without a trailing newline. Without one, it is [`KvSecret::render_dump`].
/// The buffer is zeroed on drop.
pub fn render(secret: &KvSecret, field: Option<&str>) -> Result<Zeroizing<Vec<u8>>, FieldError> {
    let bytes = match field {
        Some(name) => secret.field(name)?.as_bytes().to_vec(),
        None => secret.render_dump().into_bytes(),
    };
    Ok(Zeroizing::new(bytes))
}
