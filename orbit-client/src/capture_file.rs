//! The `.orbit` capture file format.
//!
//! A capture file is a stream of length-prefixed protobuf messages:
//!
//! ```text
//! repeat:
//!   uint32_le  message_size
//!   bytes[message_size]  message
//! ```
//!
//! The first message is the [`CaptureHeader`], the second the
//! [`CaptureInfo`] bundle, and every following message is one
//! [`TimerInfo`]; the end of the file ends the timer stream. Unknown fields
//! in any message are ignored, so newer writers stay readable.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{LittleEndian, WriteBytesExt};
use orbit_proto::{
    CaptureHeader, CaptureInfo, InternedTracepointInfo, TimerInfo,
};
use prost::Message;

use crate::capture_data::CaptureData;

pub const CAPTURE_FILE_VERSION: &str = "1.59";
pub const CAPTURE_FILE_EXTENSION: &str = "orbit";

#[derive(Debug, thiserror::Error)]
pub enum CaptureFileError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("capture file version \"{found}\" is not supported, expected \"{required}\"")]
    VersionMismatch {
        found: String,
        required: &'static str,
    },
    #[error("framing error: a message of {size} bytes would read past the end of the file")]
    Framing { size: u32 },
    #[error("malformed message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("expected a {0} message")]
    MissingMessage(&'static str),
    #[error("loading was cancelled")]
    Cancelled,
}

/// Appends the `.orbit` extension when the path has none.
pub fn with_capture_file_extension(path: &Path) -> PathBuf {
    match path.extension() {
        Some(_) => path.to_path_buf(),
        None => path.with_extension(CAPTURE_FILE_EXTENSION),
    }
}

fn write_message<M: Message>(writer: &mut impl Write, message: &M) -> std::io::Result<()> {
    let bytes = message.encode_to_vec();
    writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
    writer.write_all(&bytes)
}

/// Reads the next length-prefixed message. `Ok(None)` at a clean message
/// boundary; a partial length or payload is a framing error.
fn read_message_bytes(reader: &mut impl Read) -> Result<Option<Vec<u8>>, CaptureFileError> {
    let mut size_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < size_bytes.len() {
        let n = reader.read(&mut size_bytes[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CaptureFileError::Framing { size: 0 });
        }
        filled += n;
    }
    let size = u32::from_le_bytes(size_bytes);
    let mut bytes = vec![0u8; size as usize];
    reader
        .read_exact(&mut bytes)
        .map_err(|_| CaptureFileError::Framing { size })?;
    Ok(Some(bytes))
}

fn read_message<M: Message + Default>(
    reader: &mut impl Read,
) -> Result<Option<M>, CaptureFileError> {
    match read_message_bytes(reader)? {
        Some(bytes) => Ok(Some(M::decode(bytes.as_slice())?)),
        None => Ok(None),
    }
}

fn capture_info_from_data(capture_data: &CaptureData) -> CaptureInfo {
    CaptureInfo {
        pid: capture_data.pid(),
        capture_start_timestamp_ns: capture_data.capture_start_timestamp_ns(),
        selected_functions: capture_data.selected_functions_copy().into_iter().collect(),
        thread_names: capture_data.thread_names_copy().into_iter().collect(),
        address_infos: capture_data.address_infos_copy(),
        function_stats: capture_data.function_stats_copy().into_iter().collect(),
        callstacks: capture_data
            .callstack_data
            .unique_callstacks_copy()
            .into_iter()
            .collect(),
        callstack_events: capture_data.callstack_data.events_copy(),
        tracepoint_infos: {
            let mut infos: Vec<InternedTracepointInfo> = capture_data
                .tracepoint_data
                .tracepoint_infos_copy()
                .into_iter()
                .map(|(key, info)| InternedTracepointInfo {
                    key,
                    intern: Some(info),
                })
                .collect();
            infos.sort_by_key(|info| info.key);
            infos
        },
        tracepoint_events: capture_data.tracepoint_data.events_copy(),
        string_table: capture_data.string_table.copy_of_all().into_iter().collect(),
        thread_state_slices: capture_data.all_thread_state_slices_copy(),
    }
}

fn apply_capture_info(capture_info: CaptureInfo, capture_data: &CaptureData) {
    capture_data.set_process(capture_info.pid, capture_info.capture_start_timestamp_ns);
    capture_data.set_selected_functions(capture_info.selected_functions.into_values().collect());
    for (tid, name) in capture_info.thread_names {
        capture_data.set_thread_name(tid, &name);
    }
    for address_info in capture_info.address_infos {
        capture_data.add_address_info(address_info);
    }
    for (function_id, stats) in capture_info.function_stats {
        capture_data.set_function_stats(function_id, stats);
    }
    for (key, value) in capture_info.string_table {
        capture_data.string_table.add_if_absent(key, &value);
    }
    for (callstack_id, callstack) in capture_info.callstacks {
        capture_data
            .callstack_data
            .add_unique_callstack(callstack_id, callstack);
    }
    for event in capture_info.callstack_events {
        capture_data.callstack_data.add_callstack_event(event);
    }
    for interned in capture_info.tracepoint_infos {
        if let Some(info) = interned.intern {
            capture_data
                .tracepoint_data
                .add_tracepoint_info(interned.key, info);
        }
    }
    for event in capture_info.tracepoint_events {
        capture_data.tracepoint_data.add_tracepoint_event(event);
    }
    for slice in capture_info.thread_state_slices {
        capture_data.add_thread_state_slice(slice);
    }
}

/// Streams `capture_data` into `writer` in the capture file framing.
pub fn write_capture(
    writer: &mut impl Write,
    capture_data: &CaptureData,
) -> Result<(), CaptureFileError> {
    write_message(
        writer,
        &CaptureHeader {
            version: CAPTURE_FILE_VERSION.to_string(),
        },
    )?;
    write_message(writer, &capture_info_from_data(capture_data))?;
    let timers = capture_data.timers_copy();
    for timer in &timers {
        write_message(writer, timer)?;
    }
    Ok(())
}

/// Streams a capture file into `capture_data`. On an error partway through,
/// everything already applied stays applied; nothing is rolled back. The
/// cancellation flag is checked before each timer.
pub fn read_capture_into(
    reader: &mut impl Read,
    capture_data: &CaptureData,
    cancellation_requested: &AtomicBool,
) -> Result<(), CaptureFileError> {
    let header: CaptureHeader = read_message(reader)?
        .ok_or(CaptureFileError::MissingMessage("CaptureHeader"))?;
    if header.version != CAPTURE_FILE_VERSION {
        return Err(CaptureFileError::VersionMismatch {
            found: header.version,
            required: CAPTURE_FILE_VERSION,
        });
    }

    let capture_info: CaptureInfo = read_message(reader)?
        .ok_or(CaptureFileError::MissingMessage("CaptureInfo"))?;
    apply_capture_info(capture_info, capture_data);

    loop {
        if cancellation_requested.load(Ordering::Relaxed) {
            return Err(CaptureFileError::Cancelled);
        }
        let Some(timer) = read_message::<TimerInfo>(reader)? else {
            return Ok(());
        };
        // A timer whose function id no longer resolves is still a timer;
        // attribution is simply dropped.
        let timer = if timer.function_id != 0
            && capture_data.find_function_by_id(timer.function_id).is_none()
        {
            TimerInfo {
                function_id: 0,
                ..timer
            }
        } else {
            timer
        };
        capture_data.add_timer(timer);
    }
}

/// Convenience wrapper building a fresh [`CaptureData`] from a capture file.
pub fn load_capture(reader: &mut impl Read) -> Result<CaptureData, CaptureFileError> {
    let capture_data = CaptureData::default();
    read_capture_into(reader, &capture_data, &AtomicBool::new(false))?;
    Ok(capture_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::callstack::CallstackType;
    use orbit_proto::{
        Callstack, CallstackEvent, FullAddressInfo, FunctionInfo, ThreadStateSlice,
        TracepointEvent, TracepointInfo,
    };
    use std::io::{Seek, SeekFrom};

    fn populate(capture_data: &CaptureData) {
        capture_data.set_process(1234, 10);
        capture_data.set_selected_functions(vec![FunctionInfo {
            name: "work".to_string(),
            module_path: "/bin/app".to_string(),
            address: 0x1000,
            size: 0x40,
            function_id: 9,
        }]);
        capture_data.set_thread_name(7, "worker");
        capture_data.add_address_info(FullAddressInfo {
            absolute_address: 0x2010,
            offset_in_function: 0x10,
            function_name: "helper".to_string(),
            module_name: "/bin/app".to_string(),
        });
        capture_data.update_function_stats(9, 120);
        capture_data.update_function_stats(9, 80);
        capture_data.string_table.add_if_absent(3, "gfx");
        capture_data.callstack_data.add_unique_callstack(
            42,
            Callstack {
                frames: vec![0x1010, 0x2010],
                r#type: CallstackType::Complete as i32,
            },
        );
        capture_data.callstack_data.add_callstack_event(CallstackEvent {
            tid: 7,
            timestamp_ns: 50,
            callstack_id: 42,
        });
        capture_data.tracepoint_data.add_tracepoint_info(
            5,
            TracepointInfo {
                category: "sched".to_string(),
                name: "sched_switch".to_string(),
            },
        );
        capture_data.tracepoint_data.add_tracepoint_event(TracepointEvent {
            pid: 1234,
            tid: 7,
            timestamp_ns: 60,
            cpu: 0,
            tracepoint_info_key: 5,
        });
        capture_data.add_thread_state_slice(ThreadStateSlice {
            tid: 7,
            begin_timestamp_ns: 10,
            end_timestamp_ns: 20,
            ..Default::default()
        });
        capture_data.add_timer(TimerInfo {
            start_ns: 100,
            end_ns: 200,
            pid: 1234,
            tid: 7,
            function_id: 9,
            ..Default::default()
        });
        capture_data.add_timer(TimerInfo {
            start_ns: 150,
            end_ns: 260,
            pid: 1234,
            tid: 7,
            ..Default::default()
        });
    }

    #[test]
    fn round_trip_preserves_the_capture() {
        let original = CaptureData::default();
        populate(&original);

        let mut file = tempfile::tempfile().unwrap();
        write_capture(&mut file, &original).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let restored = load_capture(&mut file).unwrap();

        assert_eq!(restored.pid(), original.pid());
        assert_eq!(
            restored.capture_start_timestamp_ns(),
            original.capture_start_timestamp_ns()
        );
        assert_eq!(
            restored.selected_functions_copy(),
            original.selected_functions_copy()
        );
        assert_eq!(restored.thread_names_copy(), original.thread_names_copy());
        assert_eq!(restored.address_infos_copy(), original.address_infos_copy());
        assert_eq!(restored.function_stats_copy(), original.function_stats_copy());
        assert_eq!(
            restored.string_table.copy_of_all(),
            original.string_table.copy_of_all()
        );
        assert_eq!(
            restored.callstack_data.unique_callstacks_copy(),
            original.callstack_data.unique_callstacks_copy()
        );
        assert_eq!(
            restored.callstack_data.events_copy(),
            original.callstack_data.events_copy()
        );
        assert_eq!(
            restored.tracepoint_data.tracepoint_infos_copy(),
            original.tracepoint_data.tracepoint_infos_copy()
        );
        assert_eq!(
            restored.tracepoint_data.events_copy(),
            original.tracepoint_data.events_copy()
        );
        assert_eq!(
            restored.all_thread_state_slices_copy(),
            original.all_thread_state_slices_copy()
        );
        assert_eq!(restored.timers_copy(), original.timers_copy());
    }

    #[test]
    fn unsupported_version_is_rejected_naming_the_required_one() {
        let mut buffer = Vec::new();
        write_message(
            &mut buffer,
            &CaptureHeader {
                version: "0.7".to_string(),
            },
        )
        .unwrap();
        let error = load_capture(&mut buffer.as_slice()).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("0.7"));
        assert!(message.contains(CAPTURE_FILE_VERSION));
    }

    #[test]
    fn truncated_file_is_a_framing_error_with_partial_data_retained() {
        let original = CaptureData::default();
        populate(&original);
        let mut buffer = Vec::new();
        write_capture(&mut buffer, &original).unwrap();
        // Cut into the middle of the last timer message.
        buffer.truncate(buffer.len() - 3);

        let restored = CaptureData::default();
        let error = read_capture_into(
            &mut buffer.as_slice(),
            &restored,
            &AtomicBool::new(false),
        )
        .unwrap_err();
        assert!(matches!(error, CaptureFileError::Framing { .. }));
        // Everything before the torn message is still there.
        assert_eq!(restored.pid(), original.pid());
        assert_eq!(restored.timer_count(), original.timer_count() - 1);
    }

    #[test]
    fn cancellation_is_checked_before_each_timer() {
        let original = CaptureData::default();
        populate(&original);
        let mut buffer = Vec::new();
        write_capture(&mut buffer, &original).unwrap();

        let restored = CaptureData::default();
        let error = read_capture_into(
            &mut buffer.as_slice(),
            &restored,
            &AtomicBool::new(true),
        )
        .unwrap_err();
        assert!(matches!(error, CaptureFileError::Cancelled));
        assert_eq!(restored.timer_count(), 0);
        // The capture info bundle was already applied and stays.
        assert_eq!(restored.pid(), original.pid());
    }

    #[test]
    fn timer_with_unknown_function_id_loses_attribution_only() {
        let original = CaptureData::default();
        original.set_process(1, 0);
        original.add_timer(TimerInfo {
            start_ns: 1,
            end_ns: 2,
            function_id: 424242,
            ..Default::default()
        });
        let mut buffer = Vec::new();
        write_capture(&mut buffer, &original).unwrap();
        let restored = load_capture(&mut buffer.as_slice()).unwrap();
        let timers = restored.timers_copy();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].function_id, 0);
        assert_eq!(timers[0].start_ns, 1);
    }

    #[test]
    fn missing_extension_is_appended() {
        assert_eq!(
            with_capture_file_extension(Path::new("/tmp/run1")),
            PathBuf::from("/tmp/run1.orbit")
        );
        assert_eq!(
            with_capture_file_extension(Path::new("/tmp/run1.orbit")),
            PathBuf::from("/tmp/run1.orbit")
        );
    }
}
