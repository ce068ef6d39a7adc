//! USN journal reading: FSCTL_READ_USN_JOURNAL poll loops feeding the
//! monitor's shared change channel, plus history replay for catch-up
//! after a restart.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use parking_lot::Mutex;
use windows::Win32::System::Ioctl::FSCTL_READ_USN_JOURNAL;
use windows::Win32::System::IO::DeviceIoControl;

use crate::cancel::CancellationToken;
use crate::error::{FastFindError, Result};
use crate::monitor::{ChangeRecord, JournalCursor, MonitorNotice, MonitorState};
use crate::usn::{self, split_cursor, ChangeReason, RecordWalker, REASON_MASK_ALL};
use crate::win::volume::{self, UsnJournalData, VolumeHandle};

const READ_BUFFER_SIZE: usize = 64 * 1024;

const ERROR_JOURNAL_NOT_ACTIVE: i32 = 1179;
const ERROR_JOURNAL_ENTRY_DELETED: i32 = 1181;

#[repr(C)]
struct ReadUsnJournalDataV0 {
    start_usn: i64,
    reason_mask: u32,
    return_only_on_close: u32,
    timeout: u64,
    bytes_to_wait_for: u64,
    usn_journal_id: u64,
}

/// One read-journal call. Returns the next cursor and the parsed records.
fn read_once(
    vol: &VolumeHandle,
    start_usn: i64,
    journal_id: u64,
    buffer: &mut [u8],
) -> Result<(i64, Vec<ChangeRecord>)> {
    let input = ReadUsnJournalDataV0 {
        start_usn,
        reason_mask: REASON_MASK_ALL,
        return_only_on_close: 0,
        timeout: 0,
        bytes_to_wait_for: 0,
        usn_journal_id: journal_id,
    };
    let mut bytes_returned: u32 = 0;
    unsafe {
        DeviceIoControl(
            vol.raw(),
            FSCTL_READ_USN_JOURNAL,
            Some(&input as *const _ as *const _),
            mem::size_of::<ReadUsnJournalDataV0>() as u32,
            Some(buffer.as_mut_ptr() as *mut _),
            buffer.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
        .map_err(volume::os_error)?;
    }

    let Some((next_usn, records)) = split_cursor(&buffer[..bytes_returned as usize]) else {
        return Ok((start_usn, Vec::new()));
    };

    let mut out = Vec::new();
    let mut walker = RecordWalker::new(records);
    let mut scratch = String::with_capacity(260);
    while let Some(meta) = walker.next(&mut scratch)? {
        out.push(ChangeRecord {
            volume: vol.label().to_string(),
            usn: meta.usn,
            file_ref: meta.file_ref,
            parent_ref: meta.parent_ref,
            reason: ChangeReason::from_mask(meta.reason),
            raw_reason: meta.reason,
            attributes: meta.attributes,
            name: scratch.clone(),
            timestamp_ticks: meta.timestamp_ticks,
        });
    }
    Ok((next_usn as i64, out))
}

fn set_state(states: &Mutex<HashMap<String, MonitorState>>, volume: &str, state: MonitorState) {
    states.lock().insert(volume.to_string(), state);
}

/// Open the journal for a volume, creating it when absent. Implements the
/// Querying → Creating → Running edge of the monitor state machine.
fn open_journal(
    volume: &str,
    states: &Mutex<HashMap<String, MonitorState>>,
) -> Result<(VolumeHandle, UsnJournalData)> {
    set_state(states, volume, MonitorState::Querying);
    let vol = volume::open_volume(volume)?;
    match volume::query_journal(&vol) {
        Ok(journal) => Ok((vol, journal)),
        Err(FastFindError::VolumeIo { code }) if code == ERROR_JOURNAL_NOT_ACTIVE => {
            set_state(states, volume, MonitorState::Creating);
            info!("journal absent on {volume}, creating");
            volume::create_journal(&vol)?;
            let journal = volume::query_journal(&vol)?;
            Ok((vol, journal))
        }
        Err(e) => Err(e),
    }
}

/// Validate a stored cursor against the live journal; `JournalRewound`
/// when replay from it is impossible.
pub fn validate_cursor(volume: &str, cursor: JournalCursor) -> Result<UsnJournalData> {
    let vol = volume::open_volume(volume)?;
    let journal = volume::query_journal(&vol)?;
    if journal.journal_id != cursor.journal_id || cursor.usn < journal.lowest_valid_usn {
        return Err(FastFindError::JournalRewound {
            from: cursor.usn,
            to: journal.lowest_valid_usn,
        });
    }
    Ok(journal)
}

/// Poll loop for one volume. Publishes per-volume FIFO ChangeRecords to
/// the shared channel until cancelled; journal wraps surface as notices
/// and restart the cursor from the lowest valid position.
#[allow(clippy::too_many_arguments)]
pub fn poll_volume(
    volume: &str,
    resume: Option<JournalCursor>,
    poll_interval: Duration,
    cancel: &CancellationToken,
    tx: &Sender<ChangeRecord>,
    notices: &Sender<MonitorNotice>,
    states: &Arc<Mutex<HashMap<String, MonitorState>>>,
    cursors: &Arc<Mutex<HashMap<String, JournalCursor>>>,
) {
    let (vol, journal) = match open_journal(volume, states) {
        Ok(opened) => opened,
        Err(e) => {
            warn!("journal open failed on {volume}: {e}");
            set_state(states, volume, MonitorState::Error(e.to_string()));
            let _ = notices.send(MonitorNotice::VolumeError {
                volume: volume.to_string(),
                message: e.to_string(),
            });
            return;
        }
    };

    let mut cursor = match resume {
        Some(stored) if stored.journal_id == journal.journal_id => stored.usn,
        _ => journal.next_usn,
    };
    let journal_id = journal.journal_id;
    set_state(states, volume, MonitorState::Running);
    cursors.lock().insert(
        volume.to_string(),
        JournalCursor {
            usn: cursor,
            journal_id,
        },
    );
    info!("journal poll running on {volume} from usn {cursor}");

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if cancel.is_cancelled() {
            debug!("journal poll stopped on {volume}");
            break;
        }
        match read_once(&vol, cursor, journal_id, &mut buffer) {
            Ok((next_usn, records)) => {
                for record in records {
                    if tx.send(record).is_err() {
                        return;
                    }
                }
                cursor = next_usn;
                cursors.lock().insert(
                    volume.to_string(),
                    JournalCursor {
                        usn: cursor,
                        journal_id,
                    },
                );
            }
            Err(FastFindError::VolumeIo { code }) if code == ERROR_JOURNAL_ENTRY_DELETED => {
                // Wrapped: entries between our cursor and the lowest valid
                // USN are gone. The index needs a re-enumeration.
                let lowest = volume::query_journal(&vol)
                    .map(|j| j.lowest_valid_usn)
                    .unwrap_or(0);
                warn!("journal on {volume} rewound: {cursor} -> {lowest}");
                let _ = notices.send(MonitorNotice::Rewound {
                    volume: volume.to_string(),
                    from: cursor,
                    to: lowest,
                });
                cursor = lowest;
            }
            Err(e) => {
                warn!("journal read failed on {volume}: {e}");
                set_state(states, volume, MonitorState::Error(e.to_string()));
                let _ = notices.send(MonitorNotice::VolumeError {
                    volume: volume.to_string(),
                    message: e.to_string(),
                });
                break;
            }
        }
        std::thread::sleep(poll_interval);
    }
}

/// Replay journal entries from `from_usn` to the journal's current end.
/// On wrap, surfaces `JournalRewound` with the lowest valid USN so the
/// caller can re-enumerate and restart from there.
pub fn read_history(
    volume: &str,
    from_usn: i64,
    _poll_interval: Duration,
) -> Result<Vec<ChangeRecord>> {
    let vol = volume::open_volume(volume)?;
    let journal = volume::query_journal(&vol)?;
    if from_usn < journal.lowest_valid_usn {
        return Err(FastFindError::JournalRewound {
            from: from_usn,
            to: journal.lowest_valid_usn,
        });
    }

    let mut cursor = from_usn;
    let mut out = Vec::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    while cursor < journal.next_usn {
        match read_once(&vol, cursor, journal.journal_id, &mut buffer) {
            Ok((next_usn, mut records)) => {
                if records.is_empty() && next_usn <= cursor {
                    break;
                }
                out.append(&mut records);
                cursor = next_usn;
            }
            Err(FastFindError::VolumeIo { code }) if code == ERROR_JOURNAL_ENTRY_DELETED => {
                let lowest = volume::query_journal(&vol)
                    .map(|j| j.lowest_valid_usn)
                    .unwrap_or(0);
                return Err(FastFindError::JournalRewound {
                    from: cursor,
                    to: lowest,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}
