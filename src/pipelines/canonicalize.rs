//! `CanonicalizeWorkflow` sequences the full canonicalization run.
//!
//! decompose -> mark ranges -> derive GUID -> rewrite PDB -> patch image
//! -> recompute checksum. The patch address space is the shared artifact:
//! built by the scanner, consumed by the hasher and the patcher.

use crate::domain::pdb::{PdbFile, PdbInfoHeader70, PDB_HEADER_INFO_STREAM};
use crate::domain::pe::image::{CodeViewRecord, PeImage, IMAGE_DEBUG_TYPE_CODEVIEW};
use crate::infra::error::{CanonError, CanonResult};
use crate::services::guid::{hex_digest, md5_file, GuidHasher};
use crate::services::{FilePatcher, PdbRewriter, PeScanner};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Input and output paths plus write policy for one run.
#[derive(Debug, Clone)]
pub struct CanonicalizeOptions {
    pub input_image: PathBuf,
    /// Located via the image's CodeView record when absent.
    pub input_pdb: Option<PathBuf>,
    /// Defaults to rewriting the input image in place.
    pub output_image: Option<PathBuf>,
    /// Defaults to a path derived from the output image.
    pub output_pdb: Option<PathBuf>,
    /// Without this, any preexisting output path is a policy error.
    pub overwrite: bool,
    pub write_image: bool,
    pub write_pdb: bool,
}

pub struct CanonicalizeWorkflow {
    options: CanonicalizeOptions,
}

impl CanonicalizeWorkflow {
    #[must_use]
    pub fn new(options: CanonicalizeOptions) -> Self {
        Self { options }
    }

    /// Run the whole pipeline. Any error aborts the run; the output PDB
    /// is written atomically, the output image is written last-step
    /// in place.
    pub fn run(self) -> CanonResult<()> {
        let input_image = self.options.input_image.clone();
        log::info!("Analyzing PE file: {}", input_image.display());

        if !input_image.is_file() {
            return Err(CanonError::Policy(format!(
                "PE file not found: {}",
                input_image.display()
            )));
        }
        let image = PeImage::parse(std::fs::read(&input_image)?)?;
        let codeview = find_codeview(&image)?;

        let input_pdb = self.resolve_input_pdb(codeview.as_ref())?;
        let pdb = match (&input_pdb, &codeview) {
            (Some(pdb_path), Some(codeview)) => {
                let pdb = PdbFile::read(pdb_path)?;
                ensure_matched(&image_name(&input_image), pdb_path, &pdb, codeview)?;
                log::info!("Found matching PDB file: {}", pdb_path.display());
                Some(pdb)
            }
            (Some(_), None) => {
                return Err(CanonError::PeStructure(
                    "a PDB was supplied but the PE has no CodeView debug entry".into(),
                ));
            }
            (None, _) => None,
        };

        let output_image = self
            .options
            .output_image
            .clone()
            .unwrap_or_else(|| input_image.clone());
        let output_pdb = self.resolve_output_pdb(&input_image, input_pdb.as_deref(), &output_image);
        self.check_overwrite_policy(&input_image, &output_image, input_pdb.as_deref(), output_pdb.as_deref())?;

        // Mark every field, reserving the GUID range, then derive the
        // GUID over the unmodified input image.
        let scanner = PeScanner::new(pdb.is_some());
        let mut space = scanner.scan(&image)?;

        let rewritten_pdb = if let Some(mut pdb) = pdb {
            let guid = GuidHasher::derive(&input_image, &mut space)?;
            PdbRewriter::new().normalize(&mut pdb, guid)?;
            Some(pdb)
        } else {
            None
        };

        if self.options.write_image {
            FilePatcher::new().apply(&space, &input_image, &output_image)?;
            log_summary_stats(&output_image)?;
        }

        if let (Some(pdb), Some(output_pdb)) = (rewritten_pdb, output_pdb) {
            if self.options.write_pdb {
                PdbRewriter::new().write_atomic(&pdb, &output_pdb)?;
                log_summary_stats(&output_pdb)?;
            }
        }

        Ok(())
    }

    /// Use the given PDB path, or locate one through the CodeView record.
    /// An image without a CodeView entry is accepted and processed
    /// without a PDB.
    fn resolve_input_pdb(
        &self,
        codeview: Option<&CodeViewRecord>,
    ) -> CanonResult<Option<PathBuf>> {
        if let Some(path) = &self.options.input_pdb {
            if !path.is_file() {
                return Err(CanonError::Policy(format!(
                    "PDB file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        let Some(codeview) = codeview else {
            return Ok(None);
        };

        // The record names the PDB as the linker saw it; when that path
        // does not resolve, fall back to its basename next to the image.
        let recorded = PathBuf::from(&codeview.pdb_path);
        if recorded.is_absolute() && recorded.is_file() {
            return Ok(Some(recorded));
        }
        if let Some(file_name) = recorded.file_name() {
            let sibling = self
                .options
                .input_image
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(file_name);
            if sibling.is_file() {
                return Ok(Some(sibling));
            }
        }
        Err(CanonError::Policy(format!(
            "PDB file not found for PE file: {}",
            self.options.input_image.display()
        )))
    }

    /// Default output PDB path: next to the output image under the input
    /// PDB's name when the image keeps its basename, otherwise the output
    /// image path with ".pdb" appended.
    fn resolve_output_pdb(
        &self,
        input_image: &Path,
        input_pdb: Option<&Path>,
        output_image: &Path,
    ) -> Option<PathBuf> {
        let input_pdb = match input_pdb {
            Some(path) => path,
            None => {
                if let Some(ignored) = &self.options.output_pdb {
                    log::info!("Ignoring output-pdb path: {}", ignored.display());
                }
                return None;
            }
        };
        if let Some(path) = &self.options.output_pdb {
            return Some(path.clone());
        }

        if input_image.file_name() == output_image.file_name() {
            let directory = output_image.parent().unwrap_or_else(|| Path::new("."));
            Some(directory.join(input_pdb.file_name().unwrap_or_default()))
        } else {
            let mut with_extension = OsString::from(output_image.as_os_str());
            with_extension.push(".pdb");
            Some(PathBuf::from(with_extension))
        }
    }

    fn check_overwrite_policy(
        &self,
        input_image: &Path,
        output_image: &Path,
        input_pdb: Option<&Path>,
        output_pdb: Option<&Path>,
    ) -> CanonResult<()> {
        if self.options.overwrite {
            return Ok(());
        }
        if self.options.write_image
            && (output_image.exists() || paths_alias(input_image, output_image))
        {
            return Err(CanonError::Policy(
                "output image file exists; pass --overwrite to replace it".into(),
            ));
        }
        if let (true, Some(input_pdb), Some(output_pdb)) =
            (self.options.write_pdb, input_pdb, output_pdb)
        {
            if output_pdb.exists() || paths_alias(input_pdb, output_pdb) {
                return Err(CanonError::Policy(
                    "output PDB file exists; pass --overwrite to replace it".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Locate the unique CodeView debug entry, if any.
fn find_codeview(image: &PeImage) -> CanonResult<Option<CodeViewRecord>> {
    let mut codeview = None;
    for entry in image.debug_directory_entries()? {
        if entry.entry_type == IMAGE_DEBUG_TYPE_CODEVIEW {
            if codeview.is_some() {
                return Err(CanonError::PeStructure(
                    "found multiple CodeView debug directories".into(),
                ));
            }
            codeview = Some(image.codeview_record(&entry)?);
        }
    }
    Ok(codeview)
}

/// The PE and the PDB must already belong together: same signature GUID
/// and same age. Rewriting an unrelated pair would produce a PDB that
/// debuggers accept but that describes a different image.
fn ensure_matched(
    image_name: &str,
    pdb_path: &Path,
    pdb: &PdbFile,
    codeview: &CodeViewRecord,
) -> CanonResult<()> {
    let header_stream = pdb.stream(PDB_HEADER_INFO_STREAM).ok_or_else(|| {
        CanonError::PdbStructure(format!(
            "no header info stream in PDB file: {}",
            pdb_path.display()
        ))
    })?;
    let header = PdbInfoHeader70::parse(header_stream)?;

    if header.signature != codeview.guid || header.age != codeview.age {
        return Err(CanonError::Policy(format!(
            "PE and PDB are not matched: {image_name} has signature {} age {}, {} has signature {} age {}",
            hex_digest(&codeview.guid),
            codeview.age,
            pdb_path.display(),
            hex_digest(&header.signature),
            header.age
        )));
    }
    Ok(())
}

fn image_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn paths_alias(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Final per-file report: path, size and digest of what was produced.
fn log_summary_stats(path: &Path) -> CanonResult<()> {
    let (size, digest) = md5_file(path)?;
    log::info!("Path: {}", path.display());
    log::info!("  Size  : {size}");
    log::info!("  Digest: {}", hex_digest(&digest));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(input: &str) -> CanonicalizeOptions {
        CanonicalizeOptions {
            input_image: PathBuf::from(input),
            input_pdb: None,
            output_image: None,
            output_pdb: None,
            overwrite: false,
            write_image: true,
            write_pdb: true,
        }
    }

    #[test]
    fn missing_input_is_a_policy_error() {
        let workflow = CanonicalizeWorkflow::new(options("/nonexistent/image.dll"));
        let err = workflow.run().unwrap_err();
        assert!(matches!(err, CanonError::Policy(_)));
    }

    #[test]
    fn output_pdb_keeps_basename_when_image_does() {
        let workflow = CanonicalizeWorkflow::new(CanonicalizeOptions {
            output_image: Some(PathBuf::from("/out/app.dll")),
            ..options("/in/app.dll")
        });
        let resolved = workflow.resolve_output_pdb(
            Path::new("/in/app.dll"),
            Some(Path::new("/in/app.pdb")),
            Path::new("/out/app.dll"),
        );
        assert_eq!(resolved, Some(PathBuf::from("/out/app.pdb")));
    }

    #[test]
    fn output_pdb_appends_extension_when_basename_changes() {
        let workflow = CanonicalizeWorkflow::new(CanonicalizeOptions {
            output_image: Some(PathBuf::from("/out/renamed.dll")),
            ..options("/in/app.dll")
        });
        let resolved = workflow.resolve_output_pdb(
            Path::new("/in/app.dll"),
            Some(Path::new("/in/app.pdb")),
            Path::new("/out/renamed.dll"),
        );
        assert_eq!(resolved, Some(PathBuf::from("/out/renamed.dll.pdb")));
    }
}
