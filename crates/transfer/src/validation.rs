use chrono::{DateTime, Utc};
use sluice_protocol::FileInfo;
use sluice_protocol::constants::{
    FILE_MAX_SIZE, FILE_NAME_MAX_LEN, FILE_TYPE_MAX_LEN, MAX_FILE_INFO_LEN, PREVIEW_MAX_SIZE,
};

use crate::TransferError;

/// Checks a file and its metadata against the handshake limits.
///
/// Rejects:
/// - Empty files, or files larger than [`FILE_MAX_SIZE`]
/// - Names longer than [`FILE_NAME_MAX_LEN`] bytes
/// - Types longer than [`FILE_TYPE_MAX_LEN`] bytes
/// - Previews larger than [`PREVIEW_MAX_SIZE`]
pub fn validate_file_info(
    file_name: &str,
    file_type: &str,
    file_data: &[u8],
    preview: &[u8],
) -> Result<(), TransferError> {
    check_metadata(file_name, file_type, preview)?;

    if file_data.is_empty() {
        return Err(TransferError::Validation("file is empty".into()));
    }

    if file_data.len() > FILE_MAX_SIZE {
        return Err(TransferError::Validation(format!(
            "file of {} bytes exceeds maximum of {FILE_MAX_SIZE}",
            file_data.len()
        )));
    }

    Ok(())
}

/// Checks a received handshake before any state is created for it.
pub fn validate_handshake(info: &FileInfo) -> Result<(), TransferError> {
    check_metadata(&info.file_name, &info.file_type, &info.preview)?;

    let link = &info.file_link;
    if link.size == 0 || link.size as usize > FILE_MAX_SIZE {
        return Err(TransferError::Validation(format!(
            "declared size of {} bytes is outside 1..={FILE_MAX_SIZE}",
            link.size
        )));
    }
    if link.num_parts == 0 || link.num_parts as u32 > link.size {
        return Err(TransferError::Validation(format!(
            "{} parts cannot carry {} bytes",
            link.num_parts, link.size
        )));
    }
    Ok(())
}

/// Checks that the marshalled handshake fits in [`MAX_FILE_INFO_LEN`] bytes.
///
/// The link timestamp is measured at its widest rendering, so the result
/// does not depend on when the send started.
pub fn validate_handshake_len(info: &FileInfo) -> Result<(), TransferError> {
    let mut widest = info.clone();
    widest.file_link.sent_timestamp = DateTime::<Utc>::MAX_UTC;
    let len = widest.marshal()?.len();
    if len > MAX_FILE_INFO_LEN {
        return Err(TransferError::Validation(format!(
            "handshake of {len} bytes exceeds maximum of {MAX_FILE_INFO_LEN}"
        )));
    }
    Ok(())
}

fn check_metadata(file_name: &str, file_type: &str, preview: &[u8]) -> Result<(), TransferError> {
    if file_name.len() > FILE_NAME_MAX_LEN {
        return Err(TransferError::Validation(format!(
            "file name of {} bytes exceeds maximum of {FILE_NAME_MAX_LEN}",
            file_name.len()
        )));
    }

    if file_type.len() > FILE_TYPE_MAX_LEN {
        return Err(TransferError::Validation(format!(
            "file type of {} bytes exceeds maximum of {FILE_TYPE_MAX_LEN}",
            file_type.len()
        )));
    }

    if preview.len() > PREVIEW_MAX_SIZE {
        return Err(TransferError::Validation(format!(
            "preview of {} bytes exceeds maximum of {PREVIEW_MAX_SIZE}",
            preview.len()
        )));
    }
    Ok(())
}
