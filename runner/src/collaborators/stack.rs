use super::{CollaboratorError, StackWriter};
use ndarray::Array3;
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::trace;

/// Writes one raw little endian `f32` image per slice, named `{prefix}_{index:05}.raw`
#[derive(Clone, Copy, Debug, Default)]
pub struct RawStackWriter;

impl RawStackWriter {
    pub fn slice_path(prefix: &Path, index: u32) -> PathBuf {
        let mut name = OsString::from(prefix.as_os_str());
        name.push(format!("_{index:05}.raw"));

        PathBuf::from(name)
    }
}

impl StackWriter for RawStackWriter {
    fn write_stack(
        &self,
        volume: &Array3<f32>,
        prefix: &Path,
        start_index: u32,
    ) -> Result<Vec<PathBuf>, CollaboratorError> {
        let mut written = Vec::with_capacity(volume.len_of(ndarray::Axis(0)));

        for (offset, image) in volume.outer_iter().enumerate() {
            let path = Self::slice_path(prefix, start_index + offset as u32);
            let mut partial = path.clone().into_os_string();
            partial.push(".partial");
            let partial = PathBuf::from(partial);

            {
                let mut writer = BufWriter::new(File::create(&partial)?);
                for voxel in image.iter() {
                    writer.write_all(&voxel.to_le_bytes())?;
                }
                writer.into_inner().map_err(|error| error.into_error())?.sync_all()?;
            }

            // a crash never leaves a half written image under the final name
            fs::rename(&partial, &path)?;
            trace!(path = ?path, "Wrote image");

            written.push(path);
        }

        Ok(written)
    }
}
