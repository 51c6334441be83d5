//! Converting page images to `data:` URLs for vision models.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Convert binary data to a `data:` URL.
///
/// We don't percent-encode the Base64 data. Some sources say we should, but
/// several vision APIs reject it.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url() {
        assert_eq!(data_url("image/png", b"hi!"), "data:image/png;base64,aGkh");
    }
}
