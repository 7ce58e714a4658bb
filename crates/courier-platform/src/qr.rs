//! QR rendering for login payloads.

use base64::Engine;
use courier_core::error::CourierError;
use qrcode::{Color, EcLevel, QrCode};

/// Render a login payload as a compact QR code for terminal display.
///
/// Packs two rows of modules into one line of text using `▀`, `▄`, `█`, and
/// space, so the code comes out roughly half the height of a naive renderer.
pub fn render_terminal(payload: &str) -> Result<String, CourierError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::L)
        .map_err(|e| CourierError::Platform(format!("QR generation failed: {e}")))?;

    let width = code.width();
    let modules: Vec<Color> = code.into_colors();
    let dark = |row: usize, col: usize| -> bool {
        row < width && col < width && modules[row * width + col] == Color::Dark
    };

    let mut out = String::new();
    for row in (0..width).step_by(2) {
        for col in 0..width {
            out.push(match (dark(row, col), dark(row + 1, col)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        out.push('\n');
    }

    Ok(out)
}

/// Render a login payload as PNG image bytes.
pub fn render_png(payload: &str) -> Result<Vec<u8>, CourierError> {
    use image::{ImageBuffer, Luma};

    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::L)
        .map_err(|e| CourierError::Platform(format!("QR generation failed: {e}")))?;

    let module_size: u32 = 10;
    let quiet_zone: u32 = 2;
    let modules = code.width() as u32;
    let img_size = (modules + quiet_zone * 2) * module_size;

    let img = ImageBuffer::from_fn(img_size, img_size, |x, y| {
        let mx = (x / module_size).saturating_sub(quiet_zone);
        let my = (y / module_size).saturating_sub(quiet_zone);

        if x / module_size < quiet_zone
            || y / module_size < quiet_zone
            || mx >= modules
            || my >= modules
        {
            Luma([255u8])
        } else {
            match code[(mx as usize, my as usize)] {
                Color::Dark => Luma([0u8]),
                Color::Light => Luma([255u8]),
            }
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| CourierError::Platform(format!("PNG encoding failed: {e}")))?;

    Ok(buf.into_inner())
}

/// Render a login payload as a PNG `data:` URL, ready for an `<img>` tag.
pub fn render_data_url(payload: &str) -> Result<String, CourierError> {
    let png = render_png(payload)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(png);
    Ok(format!("data:image/png;base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_terminal_packs_two_rows_per_line() {
        let art = render_terminal("tg://login?token=dGVzdA").unwrap();
        let lines: Vec<&str> = art.lines().collect();
        assert!(!lines.is_empty());
        let width = lines[0].chars().count();
        assert_eq!(
            lines.len(),
            width.div_ceil(2),
            "half-block packing halves the height"
        );
        for ch in art.chars() {
            assert!(
                matches!(ch, '█' | '▀' | '▄' | ' ' | '\n'),
                "unexpected character in QR art: {ch:?}"
            );
        }
    }

    #[test]
    fn test_render_png_emits_png_magic() {
        let png = render_png("tg://login?token=dGVzdA").unwrap();
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_render_data_url_is_base64_png() {
        let url = render_data_url("tg://login?token=dGVzdA").unwrap();
        let encoded = url
            .strip_prefix("data:image/png;base64,")
            .expect("data URL prefix");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(&decoded[..4], &[0x89, b'P', b'N', b'G']);
    }
}
