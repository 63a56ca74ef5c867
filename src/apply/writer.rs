//! Raw image copy onto a block device.

use crate::error::ApplyError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Copy window
pub const WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Progress is logged each time this many more bytes have been written
pub const PROGRESS_INTERVAL: u64 = 256 * 1024 * 1024;

/// Capacity of a block device or regular file, without reading it.
pub fn device_size(path: &Path) -> Result<u64, ApplyError> {
    let mut file = File::open(path)
        .map_err(|e| ApplyError::io(format!("open target {}", path.display()), e))?;
    file.seek(SeekFrom::End(0))
        .map_err(|e| ApplyError::io(format!("query size of {}", path.display()), e))
}

/// Copy exactly `expected_len` bytes of `image` to the start of `device`
/// and make it durable.
///
/// The device is opened for writing without create or truncate. An image
/// that no longer has the validated length fails with
/// [`ApplyError::ImageChanged`]; nothing past `expected_len` is written.
pub fn write_image<F>(
    image: &Path,
    device: &Path,
    expected_len: u64,
    mut on_progress: F,
) -> Result<u64, ApplyError>
where
    F: FnMut(u64),
{
    let mut src = File::open(image)
        .map_err(|e| ApplyError::io(format!("open image {}", image.display()), e))?;
    let mut dst = OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(|e| ApplyError::io(format!("open target {} for writing", device.display()), e))?;

    let mut buf = vec![0u8; WRITE_BUFFER_SIZE];
    let mut written = 0u64;
    let mut next_report = PROGRESS_INTERVAL;

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) if written + n as u64 > expected_len => {
                return Err(ApplyError::ImageChanged {
                    expected: expected_len,
                    read: written + n as u64,
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ApplyError::io(
                    format!("read image at offset {}", written),
                    e,
                ))
            }
        };
        dst.write_all(&buf[..n]).map_err(|e| {
            ApplyError::io(
                format!("write {} at offset {}", device.display(), written),
                e,
            )
        })?;
        written += n as u64;

        if written >= next_report {
            tracing::info!("Written {} MiB", written / (1024 * 1024));
            on_progress(written);
            next_report += PROGRESS_INTERVAL;
        }
    }

    if written != expected_len {
        return Err(ApplyError::ImageChanged {
            expected: expected_len,
            read: written,
        });
    }

    dst.sync_all()
        .map_err(|e| ApplyError::io(format!("fsync {}", device.display()), e))?;
    tracing::info!("Wrote {} bytes to {}", written, device.display());
    Ok(written)
}
