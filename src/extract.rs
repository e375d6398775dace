//! Rendering group members into raster files.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use image::{DynamicImage, GrayImage};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::grouping::AcquisitionGroup;
use crate::modality::Modality;

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageFormat {
    #[default]
    Png,
    #[value(alias = "jpeg")]
    Jpg,
    Webp,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }

    fn encoder(self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpg => image::ImageFormat::Jpeg,
            ImageFormat::Webp => image::ImageFormat::WebP,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// `<modality code>-<member position>_<frame>.<ext>`; a pure function of
/// the artifact key so re-runs reproduce the same names.
pub fn artifact_name(
    modality: Modality,
    position: usize,
    frame: usize,
    format: ImageFormat,
) -> String {
    format!("{}-{position}_{frame}.{}", modality.code(), format.extension())
}

/// Stretches a grayscale frame to the full 0..=255 range; colour frames
/// are converted to 8-bit RGB unchanged.
pub fn normalize_frame(frame: &DynamicImage) -> DynamicImage {
    if frame.color().has_color() {
        return DynamicImage::ImageRgb8(frame.to_rgb8());
    }
    let luma = frame.to_luma16();
    let (min, max) = luma
        .pixels()
        .fold((u16::MAX, u16::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    let range = u32::from(max.saturating_sub(min));
    let out = GrayImage::from_fn(luma.width(), luma.height(), |x, y| {
        let v = u32::from(luma.get_pixel(x, y).0[0]);
        let scaled = match range {
            0 => 0,
            r => ((v - u32::from(min)) * 255 + r / 2) / r,
        };
        image::Luma([scaled as u8])
    });
    DynamicImage::ImageLuma8(out)
}

/// What happened to the members of one group.
#[derive(Debug, Default, PartialEq)]
pub struct ExtractReport {
    /// Member position -> file names belonging to it (written or kept).
    pub files: BTreeMap<usize, Vec<String>>,
    /// Member position -> why it has no image.
    pub pixel_errors: BTreeMap<usize, String>,
    pub written: usize,
    /// Files left in place because they existed and overwrite was off.
    pub skipped: usize,
}

/// Writes every frame of every usable member into `dir`.
pub fn extract_group(
    group: &AcquisitionGroup,
    dir: &Path,
    format: ImageFormat,
    overwrite: bool,
) -> Result<ExtractReport, PipelineError> {
    let mut report = ExtractReport::default();
    for (position, member) in group.members.iter().enumerate() {
        if let Some(reason) = member.instance.pixels.problem() {
            warn!(
                file = %member.instance.path.display(),
                modality = %member.modality,
                "no image exported: {reason}"
            );
            report.pixel_errors.insert(position, reason);
            continue;
        }
        let names = report.files.entry(position).or_default();
        for (frame_index, frame) in member.instance.pixels.frames().iter().enumerate() {
            let name = artifact_name(member.modality, position, frame_index, format);
            let path = dir.join(&name);
            names.push(name);
            if path.exists() && !overwrite {
                debug!(?path, "image exists, skipping");
                report.skipped += 1;
                continue;
            }
            normalize_frame(frame)
                .save_with_format(&path, format.encoder())
                .map_err(|source| PipelineError::Image {
                    path: path.clone(),
                    source,
                })?;
            report.written += 1;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::{GroupingPolicy, TaggedInstance, group_by_acquisition};
    use crate::reader::{DicomInstance, PixelPayload};
    use image::{ImageBuffer, Luma, Rgb};
    use std::fs;
    use std::path::PathBuf;

    fn gray16(values: &[u16]) -> DynamicImage {
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(values.len() as u32, 1, values.to_vec()).unwrap();
        DynamicImage::ImageLuma16(img)
    }

    fn member(index: usize, modality: Modality, pixels: PixelPayload) -> TaggedInstance {
        TaggedInstance {
            instance: DicomInstance {
                path: PathBuf::from(format!("{index}.dcm")),
                index,
                pixels,
                ..Default::default()
            },
            modality,
        }
    }

    #[test]
    fn names_follow_the_artifact_key() {
        assert_eq!(artifact_name(Modality::ColourPhoto, 0, 0, ImageFormat::Png), "CP-0_0.png");
        assert_eq!(artifact_name(Modality::FaIcga, 3, 12, ImageFormat::Jpg), "FA+ICGA-3_12.jpg");
        assert_eq!(artifact_name(Modality::Unknown, 1, 0, ImageFormat::Webp), "UNKNOWN-1_0.webp");
    }

    #[test]
    fn parses_formats() {
        assert_eq!(ImageFormat::from_str("JPEG", true), Ok(ImageFormat::Jpg));
        assert_eq!(ImageFormat::from_str("webp", false), Ok(ImageFormat::Webp));
        assert!(ImageFormat::from_str("tiff", true).is_err());
    }

    #[test]
    fn min_max_normalization() {
        let out = normalize_frame(&gray16(&[1000, 1500, 2000])).to_luma8();
        assert_eq!(out.as_raw(), &vec![0, 128, 255]);

        let flat = normalize_frame(&gray16(&[7, 7])).to_luma8();
        assert_eq!(flat.as_raw(), &vec![0, 0]);
    }

    #[test]
    fn colour_frames_stay_rgb() {
        let rgb: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(1, 1, vec![10, 20, 30]).unwrap();
        let out = normalize_frame(&DynamicImage::ImageRgb8(rgb));
        assert_eq!(out.to_rgb8().as_raw(), &vec![10, 20, 30]);
    }

    #[test]
    fn writes_frames_and_reports_unusable_members() {
        let dir = tempfile::tempdir().unwrap();
        let instances = vec![
            member(0, Modality::Oct, PixelPayload::Frames(vec![gray16(&[0, 1]), gray16(&[2, 3])])),
            member(1, Modality::Unknown, PixelPayload::Unusable("unsupported encoding".into())),
            member(2, Modality::ColourPhoto, PixelPayload::Frames(vec![gray16(&[5, 9])])),
        ];
        let groups = group_by_acquisition(&instances, "k", GroupingPolicy::ByFolder);

        let report = extract_group(&groups[0], dir.path(), ImageFormat::Png, false).unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.files[&0], vec!["OCT-0_0.png", "OCT-0_1.png"]);
        assert_eq!(report.files[&2], vec!["CP-2_0.png"]);
        assert_eq!(report.pixel_errors[&1], "unsupported encoding");
        assert!(dir.path().join("OCT-0_1.png").exists());
        assert!(!dir.path().join("UNKNOWN-1_0.png").exists());

        // existing files are kept unless overwriting
        fs::write(dir.path().join("CP-2_0.png"), b"marker").unwrap();
        let again = extract_group(&groups[0], dir.path(), ImageFormat::Png, false).unwrap();
        assert_eq!((again.written, again.skipped), (0, 3));
        assert_eq!(fs::read(dir.path().join("CP-2_0.png")).unwrap(), b"marker");
        assert_eq!(again.files, report.files);

        let forced = extract_group(&groups[0], dir.path(), ImageFormat::Png, true).unwrap();
        assert_eq!(forced.written, 3);
        assert_ne!(fs::read(dir.path().join("CP-2_0.png")).unwrap(), b"marker");
    }
}
