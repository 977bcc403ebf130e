use std::io::Cursor;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::response::Html;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageOutputFormat, RgbImage};

use crate::error::ServiceError;
use crate::inference::{parse_sensitivity, run_inference};
use crate::server::AppState;

/// The two upload representations the UI accepts: an encoded image file,
/// or a raw RGB pixel buffer with explicit dimensions.
pub enum ImageInput {
    Encoded(Vec<u8>),
    Pixels {
        width: u32,
        height: u32,
        rgb: Vec<u8>,
    },
}

impl ImageInput {
    /// Normalizes either representation into PNG transport bytes.
    pub fn into_png_bytes(self) -> Result<Vec<u8>, ServiceError> {
        let image = match self {
            ImageInput::Encoded(bytes) => {
                if bytes.is_empty() {
                    return Err(ServiceError::EmptyUpload);
                }
                image::load_from_memory(&bytes)?
            }
            ImageInput::Pixels { width, height, rgb } => {
                let buffer = RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
                    ServiceError::ImageInput(format!(
                        "pixel buffer does not match {width}x{height} RGB"
                    ))
                })?;
                DynamicImage::ImageRgb8(buffer)
            }
        };

        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;
        Ok(png)
    }
}

const FORM_PAGE: &str = r#"<!doctype html>
<html>
<head><title>PatchCore Anomaly Detection</title></head>
<body>
<h2>PatchCore Anomaly Detection</h2>
<p>Upload an image to get the boxed anomaly visualization and JSON detections.
You can also tweak sensitivity or provide feedback JSON from your backend.</p>
<form method="post" action="/ui" enctype="multipart/form-data">
  <p><label>Image: <input type="file" name="file" accept="image/*"></label></p>
  <p><label>Detection sensitivity (0.1 - 2.0):
    <input type="number" name="sensitivity" min="0.1" max="2.0" step="0.05" value="1.0"></label></p>
  <p><label>Feedback JSON (optional):<br>
    <textarea name="feedback_json" rows="4" cols="60"
      placeholder='{"label_adjustments": {...}}'></textarea></label></p>
  <p><label>Checkpoint URL override (optional):
    <input type="text" name="ckpt_url" size="60"
      placeholder="https://.../model.ckpt"></label></p>
  <p><button type="submit">Run inference</button></p>
</form>
</body>
</html>
"#;

pub async fn form_page() -> Html<&'static str> {
    Html(FORM_PAGE)
}

struct UiFields {
    image: Option<ImageInput>,
    pixel_buffer: Option<Vec<u8>>,
    width: Option<u32>,
    height: Option<u32>,
    sensitivity: f32,
    feedback_text: String,
    ckpt_url: Option<String>,
}

async fn collect_ui_fields(multipart: &mut Multipart) -> Result<UiFields, ServiceError> {
    let mut fields = UiFields {
        image: None,
        pixel_buffer: None,
        width: None,
        height: None,
        sensitivity: 1.0,
        feedback_text: String::new(),
        ckpt_url: None,
    };

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => {
                let bytes = field.bytes().await?.to_vec();
                if !bytes.is_empty() {
                    fields.image = Some(ImageInput::Encoded(bytes));
                }
            }
            Some("pixels") => {
                fields.pixel_buffer = Some(field.bytes().await?.to_vec());
            }
            Some("width") => {
                fields.width = field.text().await?.trim().parse().ok();
            }
            Some("height") => {
                fields.height = field.text().await?.trim().parse().ok();
            }
            Some("sensitivity") => {
                fields.sensitivity = parse_sensitivity(&field.text().await?);
            }
            Some("feedback_json") => {
                fields.feedback_text = field.text().await?;
            }
            Some("ckpt_url") => {
                let url = field.text().await?;
                if !url.trim().is_empty() {
                    fields.ckpt_url = Some(url.trim().to_string());
                }
            }
            _ => {}
        }
    }

    // A raw pixel upload only counts when both dimensions came along.
    if fields.image.is_none() {
        if let (Some(rgb), Some(width), Some(height)) =
            (fields.pixel_buffer.take(), fields.width, fields.height)
        {
            fields.image = Some(ImageInput::Pixels { width, height, rgb });
        }
    }

    Ok(fields)
}

/// Browser form handler. Failures render as an inline message on the
/// result page instead of surfacing as an error response.
pub async fn submit_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Html<String> {
    match run_for_ui(&state, &mut multipart).await {
        Ok(page) => Html(page),
        Err(err) => Html(render_error(&err.to_string())),
    }
}

async fn run_for_ui(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<String, ServiceError> {
    let fields = collect_ui_fields(multipart).await?;
    let image = fields.image.ok_or(ServiceError::EmptyUpload)?;
    let png_bytes = image.into_png_bytes()?;

    let result = run_inference(
        &state.cache,
        &png_bytes,
        "upload.png",
        fields.sensitivity,
        &fields.feedback_text,
        fields.ckpt_url.as_deref(),
    )
    .await?;

    let pretty_report =
        serde_json::to_string_pretty(&result.report).unwrap_or_else(|_| result.report_text.clone());
    Ok(render_result(
        result.label.as_deref().unwrap_or(""),
        &BASE64_STANDARD.encode(&result.boxed_bytes),
        mime_for_ext(&result.boxed_image_ext),
        &pretty_report,
        result.feedback_applied,
    ))
}

fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".bmp" => "image/bmp",
        _ => "image/png",
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_result(
    label: &str,
    boxed_base64: &str,
    mime: &str,
    pretty_report: &str,
    feedback_applied: bool,
) -> String {
    format!(
        "<!doctype html>\n<html>\n<head><title>PatchCore result</title></head>\n<body>\n\
         <h2>Predicted label: {}</h2>\n\
         <p>Feedback applied: {}</p>\n\
         <p><img alt=\"Boxed output\" src=\"data:{};base64,{}\"></p>\n\
         <h3>Detection JSON</h3>\n<pre>{}</pre>\n\
         <p><a href=\"/ui\">Run another image</a></p>\n\
         </body>\n</html>\n",
        escape_html(label),
        feedback_applied,
        mime,
        boxed_base64,
        escape_html(pretty_report),
    )
}

fn render_error(message: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head><title>PatchCore result</title></head>\n<body>\n\
         <h2>Error</h2>\n<p>{}</p>\n\
         <p><a href=\"/ui\">Back</a></p>\n\
         </body>\n</html>\n",
        escape_html(message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_input_round_trips_through_png() {
        let rgb = vec![200u8; 4 * 3 * 3];
        let input = ImageInput::Pixels {
            width: 4,
            height: 3,
            rgb,
        };

        let png = input.into_png_bytes().unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 3);
    }

    #[test]
    fn mismatched_pixel_buffer_is_rejected() {
        let input = ImageInput::Pixels {
            width: 10,
            height: 10,
            rgb: vec![0u8; 5],
        };
        assert!(matches!(
            input.into_png_bytes(),
            Err(ServiceError::ImageInput(_))
        ));
    }

    #[test]
    fn encoded_input_is_reencoded_as_png() {
        let mut source = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3])))
            .write_to(&mut Cursor::new(&mut source), ImageOutputFormat::Jpeg(90))
            .unwrap();

        let png = ImageInput::Encoded(source).into_png_bytes().unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 2);
    }

    #[test]
    fn empty_encoded_input_is_an_empty_upload() {
        assert!(matches!(
            ImageInput::Encoded(Vec::new()).into_png_bytes(),
            Err(ServiceError::EmptyUpload)
        ));
    }

    #[test]
    fn garbage_bytes_fail_decoding() {
        let err = ImageInput::Encoded(b"not an image".to_vec())
            .into_png_bytes()
            .unwrap_err();
        assert!(matches!(err, ServiceError::Image(_)));
    }
}
