//! Pairing code rendering.

use base64::Engine as _;
use qrcode::render::{svg, unicode};
use qrcode::QrCode;

use crate::errors::{PairingError, PairingResult};

/// Turns a pairing code into something a person can scan.
pub trait CodeRenderer: Send + Sync {
    /// Image of the code as a `data:` URL, suitable for an `<img src>`.
    fn render_data_url(&self, code: &str) -> PairingResult<String>;

    /// Text rendering for a terminal or log line.
    fn render_terminal(&self, code: &str) -> PairingResult<String>;
}

/// QR renderer producing SVG data URLs and half-block terminal art.
#[derive(Debug, Clone)]
pub struct QrRenderer {
    pub min_dimension: u32,
}

impl Default for QrRenderer {
    fn default() -> Self {
        Self { min_dimension: 256 }
    }
}

impl QrRenderer {
    fn encode(code: &str) -> PairingResult<QrCode> {
        QrCode::new(code.as_bytes()).map_err(|e| PairingError::Render(e.to_string()))
    }
}

impl CodeRenderer for QrRenderer {
    fn render_data_url(&self, code: &str) -> PairingResult<String> {
        let image = Self::encode(code)?
            .render()
            .min_dimensions(self.min_dimension, self.min_dimension)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#FFFFFF"))
            .build();

        let encoded = base64::engine::general_purpose::STANDARD.encode(image.as_bytes());
        Ok(format!("data:image/svg+xml;base64,{encoded}"))
    }

    fn render_terminal(&self, code: &str) -> PairingResult<String> {
        Ok(Self::encode(code)?
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .quiet_zone(true)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url_is_svg() {
        let url = QrRenderer::default()
            .render_data_url("2@AbCdEf,ghIJ,klMN")
            .unwrap();
        let payload = url.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        assert!(String::from_utf8(svg).unwrap().contains("<svg"));
    }

    #[test]
    fn test_terminal_rendering_is_multiline() {
        let art = QrRenderer::default().render_terminal("pair-me").unwrap();
        assert!(art.lines().count() > 10);
    }
}
