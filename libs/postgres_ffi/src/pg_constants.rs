/// Size of one WAL segment file. Postgres lets this be configured at
/// `initdb` time but 16 MiB is by far the common default, and is the only
/// size this subsystem's segment-boundary logic (C4/C7) assumes.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Every WAL segment filename currently shipped is tagged with timeline 1;
/// multi-timeline promotion handling lives outside this subsystem (out of
/// scope per the backup/WAL-shipping spec).
pub const PG_TLI: u32 = 1;
