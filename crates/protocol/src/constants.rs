/// Maximum length of a file name in bytes.
pub const FILE_NAME_MAX_LEN: usize = 48;

/// Maximum length of a file type in bytes.
pub const FILE_TYPE_MAX_LEN: usize = 8;

/// Maximum size of a transferable file in bytes.
pub const FILE_MAX_SIZE: usize = 250_000;

/// Maximum size of the preview blob carried in the handshake.
pub const PREVIEW_MAX_SIZE: usize = 590;

/// Largest marshalled handshake the substrate carries in one message.
pub const MAX_FILE_INFO_LEN: usize = 802;

/// Smallest number of parts the batch builder puts in one batch.
pub const MIN_PARTS_PER_BATCH: usize = 1;

/// Largest number of parts the batch builder puts in one batch.
pub const MAX_PARTS_PER_BATCH: usize = 11;

/// Capacity of the queue feeding the batch builder.
pub const BATCH_QUEUE_LEN: usize = 10_000;

/// Capacity of the queue feeding the worker pool.
pub const SEND_QUEUE_LEN: usize = 10_000;

/// Capacity of the queue feeding the resend checker.
pub const SENT_QUEUE_LEN: usize = 10_000;
