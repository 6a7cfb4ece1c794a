//! PDF assembly for downloaded parts.
//!
//! Each page image becomes one PDF page whose MediaBox is the image's pixel
//! size. JPEG data is embedded untouched; other formats are decoded and stored
//! as Flate-compressed RGB. Pages that failed permanently but fall within the
//! failure tolerance are kept as blank placeholders so page numbering survives.

mod error;

use std::fs;
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

use image::{ExtendedColorType, ImageDecoder, ImageFormat, ImageReader};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, ObjectId, Stream, dictionary};
use tracing::{debug, info, instrument, warn};

use crate::download::page_file::partial_path;

pub use error::AssemblyError;

/// A4 in points, used for a placeholder with no preceding page.
const PLACEHOLDER_SIZE: (i64, i64) = (595, 842);

/// One page of an assembly request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInput {
    /// Zero-based page index within the manuscript.
    pub index: usize,
    /// Downloaded image, or `None` when the page failed permanently.
    pub file: Option<PathBuf>,
}

/// Everything needed to turn one part into a PDF.
#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    /// Document title written to the PDF info dictionary.
    pub title: String,
    /// Pages of the part, in any order.
    pub pages: Vec<PageInput>,
    /// Final PDF path.
    pub output_path: PathBuf,
    /// Directory of page files, removed after a successful write.
    pub page_dir: Option<PathBuf>,
}

impl AssemblyRequest {
    /// Number of pages without a file.
    #[must_use]
    pub fn failed_pages(&self) -> usize {
        self.pages.iter().filter(|page| page.file.is_none()).count()
    }
}

/// Writes PDFs from page images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfAssembler {
    failure_tolerance: f64,
}

impl Default for PdfAssembler {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl PdfAssembler {
    /// Creates an assembler; `failure_tolerance` is clamped to `0.0..=1.0`.
    #[must_use]
    pub fn new(failure_tolerance: f64) -> Self {
        let failure_tolerance = if failure_tolerance.is_finite() {
            failure_tolerance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { failure_tolerance }
    }

    /// Allowed failed fraction.
    #[must_use]
    pub fn failure_tolerance(&self) -> f64 {
        self.failure_tolerance
    }

    /// Whether `failed` of `total` pages is acceptable for assembly.
    ///
    /// A part with no failed pages always passes. Otherwise the failed
    /// fraction must be strictly below the tolerance, so the default of `0.0`
    /// admits no failures and `0.25` admits 1 of 5 pages but not 1 of 4.
    ///
    /// # Errors
    ///
    /// [`AssemblyError::ToleranceExceeded`] when the failed fraction reaches the tolerance.
    #[allow(clippy::cast_precision_loss)]
    pub fn check_tolerance(&self, failed: usize, total: usize) -> Result<(), AssemblyError> {
        if failed == 0 {
            return Ok(());
        }
        let fraction = failed as f64 / total.max(1) as f64;
        if fraction < self.failure_tolerance {
            Ok(())
        } else {
            Err(AssemblyError::ToleranceExceeded {
                failed,
                total,
                tolerance: self.failure_tolerance,
            })
        }
    }

    /// Writes the PDF and returns its path.
    ///
    /// Blocking: callers on the runtime should use `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Fails on tolerance, unreadable images, or write errors. The page
    /// directory is left in place on any failure.
    #[instrument(skip(self, request), fields(output = %request.output_path.display(), pages = request.pages.len()))]
    pub fn assemble(&self, request: &AssemblyRequest) -> Result<PathBuf, AssemblyError> {
        if request.pages.is_empty() {
            return Err(AssemblyError::NoPages {
                path: request.output_path.clone(),
            });
        }
        self.check_tolerance(request.failed_pages(), request.pages.len())?;

        let mut pages: Vec<&PageInput> = request.pages.iter().collect();
        pages.sort_by_key(|page| page.index);

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
        let mut last_size = PLACEHOLDER_SIZE;

        for page in pages {
            let page_id = match &page.file {
                Some(path) => {
                    let image = embed_image(&mut doc, page.index, path)?;
                    last_size = (image.width, image.height);
                    add_image_page(&mut doc, pages_id, &image, &request.output_path)?
                }
                None => {
                    debug!(index = page.index, "inserting placeholder for failed page");
                    add_blank_page(&mut doc, pages_id, last_size)
                }
            };
            kids.push(page_id.into());
        }

        let count = i64::try_from(kids.len()).unwrap_or(i64::MAX);
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Title" => Object::string_literal(request.title.as_str()),
            "Producer" => Object::string_literal(concat!("mss-downloader ", env!("CARGO_PKG_VERSION"))),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);

        write_atomically(&mut doc, &request.output_path)?;
        info!(pages = count, "part assembled");

        if let Some(dir) = &request.page_dir
            && let Err(e) = fs::remove_dir_all(dir)
        {
            warn!(dir = %dir.display(), error = %e, "could not remove page directory");
        }

        Ok(request.output_path.clone())
    }
}

struct EmbeddedImage {
    id: ObjectId,
    width: i64,
    height: i64,
}

fn embed_image(doc: &mut Document, index: usize, path: &Path) -> Result<EmbeddedImage, AssemblyError> {
    let image_error = |reason: String| AssemblyError::Image {
        index,
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|e| AssemblyError::io(path, e))?;
    let jpeg = {
        let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| image_error(e.to_string()))?;
        if reader.format() == Some(ImageFormat::Jpeg) {
            let decoder = reader.into_decoder().map_err(|e| image_error(e.to_string()))?;
            let (width, height) = decoder.dimensions();
            // CMYK and other JPEG variants are re-encoded below.
            match decoder.original_color_type() {
                ExtendedColorType::L8 => Some((width, height, "DeviceGray")),
                ExtendedColorType::Rgb8 => Some((width, height, "DeviceRGB")),
                _ => None,
            }
        } else {
            None
        }
    };

    if let Some((width, height, color_space)) = jpeg {
        let stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(width),
                "Height" => i64::from(height),
                "ColorSpace" => color_space,
                "BitsPerComponent" => 8_i64,
                "Filter" => "DCTDecode",
            },
            bytes,
        )
        .with_compression(false);
        return Ok(EmbeddedImage {
            id: doc.add_object(stream),
            width: i64::from(width),
            height: i64::from(height),
        });
    }

    let rgb = image::load_from_memory(&bytes)
        .map_err(|e| image_error(e.to_string()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(width),
            "Height" => i64::from(height),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8_i64,
        },
        rgb.into_raw(),
    );
    stream
        .compress()
        .map_err(|e| image_error(format!("compression failed: {e}")))?;

    Ok(EmbeddedImage {
        id: doc.add_object(stream),
        width: i64::from(width),
        height: i64::from(height),
    })
}

fn add_image_page(
    doc: &mut Document,
    parent: ObjectId,
    image: &EmbeddedImage,
    output: &Path,
) -> Result<ObjectId, AssemblyError> {
    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    image.width.into(),
                    0_i64.into(),
                    0_i64.into(),
                    image.height.into(),
                    0_i64.into(),
                    0_i64.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let encoded = content.encode().map_err(|e| AssemblyError::pdf(output, e))?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

    Ok(doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => parent,
        "MediaBox" => vec![0_i64.into(), 0_i64.into(), image.width.into(), image.height.into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! {
                "Im0" => image.id,
            },
        },
    }))
}

fn add_blank_page(doc: &mut Document, parent: ObjectId, (width, height): (i64, i64)) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => parent,
        "MediaBox" => vec![0_i64.into(), 0_i64.into(), width.into(), height.into()],
        "Resources" => dictionary! {},
    })
}

fn write_atomically(doc: &mut Document, output: &Path) -> Result<(), AssemblyError> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| AssemblyError::io(parent, e))?;
    }

    let temp = partial_path(output);
    let result = fs::File::create(&temp)
        .map_err(|e| AssemblyError::io(&temp, e))
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            doc.save_to(&mut writer)
                .map_err(|e| AssemblyError::pdf(output, e))?;
            writer
                .into_inner()
                .map_err(|e| AssemblyError::io(&temp, e.into_error()))?
                .sync_all()
                .map_err(|e| AssemblyError::io(&temp, e))
        });

    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    fs::rename(&temp, output).map_err(|e| AssemblyError::io(output, e))
}
