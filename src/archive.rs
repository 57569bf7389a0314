//! Tar+gzip packing and unpacking for directory-shaped layers.
//!
//! A convenience layer on top of [`crate::manifest::Layer`]: pack a directory
//! tree into a single compressed layer blob, or unpack one back onto disk.
//! File content, symlinks, empty directories, and POSIX modes all round-trip.
use crate::errors::OciDistributionError;
use crate::manifest::{Layer, IMAGE_LAYER_GZIP_MEDIA_TYPE};
use std::io::Write;
use std::path::Path;

/// Tar and gzip `dir`'s contents into a single [`Layer`] with media type
/// [`IMAGE_LAYER_GZIP_MEDIA_TYPE`].
///
/// Symlinks are stored as symlinks (not followed), empty subdirectories are
/// preserved as directory entries, and each entry's POSIX mode is taken from
/// its on-disk metadata.
pub fn pack_directory(dir: &Path) -> Result<Layer, OciDistributionError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let tar_bytes = builder.into_inner()?;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes)?;
    let gz_bytes = encoder.finish()?;

    Ok(Layer::from_bytes(IMAGE_LAYER_GZIP_MEDIA_TYPE, gz_bytes))
}

/// Unpack a tar+gzip layer's bytes onto disk at `dest`, creating it if
/// necessary.
///
/// Symlinks, empty directories, and POSIX modes are restored from the
/// archive entries as written by [`pack_directory`].
pub fn unpack_layer(layer_bytes: &[u8], dest: &Path) -> Result<(), OciDistributionError> {
    std::fs::create_dir_all(dest)?;
    let decoder = flate2::read::GzDecoder::new(layer_bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::{symlink, PermissionsExt};

    #[test]
    fn round_trips_files_and_empty_directories() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello.txt"), b"hello world").unwrap();
        std::fs::create_dir(src.path().join("empty")).unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("nested/inner.txt"), b"inner").unwrap();

        let layer = pack_directory(src.path()).unwrap();
        let bytes = layer.data.as_ref().unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack_layer(bytes, dest.path()).unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("hello.txt")).unwrap(),
            b"hello world"
        );
        assert!(dest.path().join("empty").is_dir());
        assert_eq!(
            std::fs::read(dest.path().join("nested/inner.txt")).unwrap(),
            b"inner"
        );
    }

    #[test]
    #[cfg(unix)]
    fn round_trips_symlinks_and_posix_modes() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("target.txt"), b"target").unwrap();
        symlink("target.txt", src.path().join("link.txt")).unwrap();
        let exe = src.path().join("run.sh");
        std::fs::write(&exe, b"#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let layer = pack_directory(src.path()).unwrap();
        let bytes = layer.data.as_ref().unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack_layer(bytes, dest.path()).unwrap();

        let link = dest.path().join("link.txt");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            Path::new("target.txt")
        );

        let restored = dest.path().join("run.sh");
        let mode = std::fs::metadata(&restored).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn layer_descriptor_has_gzip_media_type() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a"), b"a").unwrap();
        let layer = pack_directory(src.path()).unwrap();
        assert_eq!(layer.descriptor.media_type, IMAGE_LAYER_GZIP_MEDIA_TYPE);
    }
}
