//! Kernel log records to log indications.

use tether_proto::LogEntryInd;

/// Parses one `/dev/kmsg` record (`prio,seq,usecs,flags;text`) into an
/// indication of `["[sssss.uuuuuu] ", text]`. Malformed lines and
/// continuation lines yield `None`.
pub fn indication(line: &str) -> Option<LogEntryInd> {
    let (prefix, text) = line.split_once(';')?;
    let mut fields = prefix.split(',');
    fields.next()?.parse::<u32>().ok()?;
    fields.next()?.parse::<u64>().ok()?;
    let usecs: u64 = fields.next()?.parse().ok()?;
    Some(LogEntryInd {
        text: vec![
            format!("[{:5}.{:06}] ", usecs / 1_000_000, usecs % 1_000_000),
            text.to_owned(),
        ],
    })
}
