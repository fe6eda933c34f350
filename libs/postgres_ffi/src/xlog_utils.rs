use crate::pg_constants::WAL_SEGMENT_SIZE;
use utils::lsn::Lsn;

/// A WAL segment number: how many `WAL_SEGMENT_SIZE`-byte segments have
/// elapsed since the start of the WAL stream.
pub type XLogSegNo = u64;

#[derive(Debug, thiserror::Error)]
pub enum XLogFileNameParseError {
    #[error("malformed WAL segment filename: {0:?}")]
    Malformed(String),
}

/// Segment number containing the given LSN, for the configured segment size.
pub fn lsn_to_segno(lsn: Lsn, wal_seg_size: u64) -> XLogSegNo {
    u64::from(lsn) / wal_seg_size
}

pub fn segno_to_lsn(segno: XLogSegNo, wal_seg_size: u64) -> Lsn {
    Lsn(segno * wal_seg_size)
}

/// Renders the 24 hex-digit WAL segment filename `TTTTTTTTLLLLLLLLSSSSSSSS`:
/// 8 digits of timeline id, then the segment number split into a high
/// "log id" and low "segment within log id" part, the same split Postgres
/// uses so that segment numbers keep sorting lexically.
pub fn xlog_file_name(tli: u32, segno: XLogSegNo, wal_seg_size: u64) -> String {
    let segments_per_xlog_id = 0x1_0000_0000u64 / wal_seg_size;
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        segno / segments_per_xlog_id,
        segno % segments_per_xlog_id,
    )
}

/// Convenience wrapper using the default (16 MiB) segment size.
pub fn xlog_segment_file_name(tli: u32, segno: XLogSegNo) -> String {
    xlog_file_name(tli, segno, WAL_SEGMENT_SIZE)
}

pub fn parse_xlog_file_name(fname: &str) -> Result<(u32, XLogSegNo, u64), XLogFileNameParseError> {
    if fname.len() != 24 || !fname.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(XLogFileNameParseError::Malformed(fname.to_string()));
    }
    let tli = u32::from_str_radix(&fname[0..8], 16)
        .map_err(|_| XLogFileNameParseError::Malformed(fname.to_string()))?;
    let log_id = u64::from_str_radix(&fname[8..16], 16)
        .map_err(|_| XLogFileNameParseError::Malformed(fname.to_string()))?;
    let seg_id = u64::from_str_radix(&fname[16..24], 16)
        .map_err(|_| XLogFileNameParseError::Malformed(fname.to_string()))?;
    let segments_per_xlog_id = 0x1_0000_0000u64 / WAL_SEGMENT_SIZE;
    Ok((tli, log_id * segments_per_xlog_id + seg_id, WAL_SEGMENT_SIZE))
}
