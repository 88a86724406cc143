use crate::TransferError;

/// Splits `data` into parts of exactly `part_size` bytes.
///
/// The last part is zero-padded; receivers trim it using the declared file
/// size.
pub fn partition_file(data: &[u8], part_size: usize) -> Result<Vec<Vec<u8>>, TransferError> {
    if part_size == 0 {
        return Err(TransferError::Validation("part size must be non-zero".into()));
    }
    let num_parts = data.len().div_ceil(part_size);
    if num_parts > u16::MAX as usize {
        return Err(TransferError::Validation(format!(
            "file needs {num_parts} parts, more than the {} a transfer can carry",
            u16::MAX
        )));
    }

    Ok(data
        .chunks(part_size)
        .map(|chunk| {
            let mut part = vec![0u8; part_size];
            part[..chunk.len()].copy_from_slice(chunk);
            part
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_last_part() {
        let parts = partition_file(b"abcdefg", 3).unwrap();
        assert_eq!(parts, vec![b"abc".to_vec(), b"def".to_vec(), b"g\0\0".to_vec()]);
    }

    #[test]
    fn exact_multiple_has_no_extra_part() {
        let parts = partition_file(&[1u8; 30], 10).unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() == 10));
    }

    #[test]
    fn rejects_zero_part_size() {
        assert!(matches!(
            partition_file(b"abc", 0),
            Err(TransferError::Validation(_))
        ));
    }

    #[test]
    fn rejects_too_many_parts() {
        let data = vec![0u8; u16::MAX as usize + 1];
        assert!(partition_file(&data, 1).is_err());
    }
}
