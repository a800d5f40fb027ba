/// Leading bytes of a zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Suffix appended to artifacts whose payload is a zstd stream.
pub const ZSTD_SUFFIX: &str = ".zst";

/// Whether `data` starts with a zstd frame header. Nothing is decompressed;
/// the payload is archived as-is.
pub fn is_zstd(data: &[u8]) -> bool {
    data.starts_with(&ZSTD_MAGIC)
}
