//! End-to-end pipeline runs over the synthetic trace session.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use etw_common::params::{ParamName, ParamValue, Params};
use etw_common::record::{EventRecord, RecordHeader};
use etw_common::test_utils::{
    TestDriverEnum, TestHandleApi, TestObjectNameApi, TestProcessApi, TestTraceApi,
};
use kestrel_core::config::{KstreamConfig, TraceSessionConfig, KERNEL_LOGGER_SESSION};
use kestrel_core::event::Event;
use kestrel_core::kind::EventKind;
use kestrel_core::metrics::Metrics;
use kestrel_core::pdk::{otypes, InMemoryObjectTypeStore, ObjectTypeStore};
use kestrel_core::sequencer::Sequencer;
use kestrel_core::test_utils::{
    FixedPeReader, MapDevMapper, RecordingHandleSnapshotter, RejectKindsFilter,
};
use kestrel_kstream::{KstreamConsumer, OsContext};
use kestrel_ps::ProcessSnapshotter;

struct Harness {
    trace_api: Arc<TestTraceApi>,
    type_store: Arc<InMemoryObjectTypeStore>,
    metrics: Arc<Metrics>,
    psnap: Arc<ProcessSnapshotter>,
    consumer: KstreamConsumer,
}

fn harness(config: KstreamConfig) -> Harness {
    let trace_api = TestTraceApi::new();
    let process_api = TestProcessApi::new();
    let handle_api = TestHandleApi::new();
    let object_names = TestObjectNameApi::new();
    let drivers = TestDriverEnum::new();
    let hsnap = Arc::new(RecordingHandleSnapshotter::default());
    let type_store = Arc::new(InMemoryObjectTypeStore::default());
    let metrics = Arc::new(Metrics::default());
    let psnap = ProcessSnapshotter::new(
        hsnap.clone(),
        process_api.clone(),
        Arc::new(FixedPeReader::default()),
        &config,
        metrics.clone(),
    );
    let consumer = KstreamConsumer::new(
        OsContext {
            trace_api: trace_api.clone(),
            process_api: process_api.clone(),
            handle_api,
            object_name_api: object_names,
            drivers,
        },
        psnap.clone(),
        hsnap,
        type_store.clone(),
        Arc::new(MapDevMapper::new(&[("\\Device\\HarddiskVolume2", "C:")])),
        Arc::new(Sequencer::in_memory()),
        config,
        metrics.clone(),
    );
    Harness {
        trace_api,
        type_store,
        metrics,
        psnap,
        consumer,
    }
}

fn header(kind: EventKind, pid: u32) -> RecordHeader {
    RecordHeader {
        wire_id: kind.wire_id(),
        timestamp: SystemTime::now(),
        pid,
        tid: 1,
        cpu: 0,
    }
}

fn process_record(
    kind: EventKind,
    header_pid: u32,
    pid: u32,
    ppid: u32,
    image: &str,
    cmdline: &str,
) -> EventRecord {
    let mut params = Params::new();
    params.append(ParamName::ProcessId, ParamValue::U32(pid));
    params.append(ParamName::ParentId, ParamValue::U32(ppid));
    params.append(ParamName::ProcessName, ParamValue::AnsiStr(image.into()));
    params.append(ParamName::Cmdline, ParamValue::Utf16Str(cmdline.into()));
    params.append(ParamName::SessionId, ParamValue::U32(0));
    EventRecord::new(header(kind, header_pid), params)
}

fn thread_record(kind: EventKind, header_pid: u32, pid: u32, tid: u32) -> EventRecord {
    let mut params = Params::new();
    params.append(ParamName::ProcessId, ParamValue::U32(pid));
    params.append(ParamName::ThreadId, ParamValue::U32(tid));
    EventRecord::new(header(kind, header_pid), params)
}

fn handle_record(
    kind: EventKind,
    header_pid: u32,
    handle_id: u32,
    type_id: u16,
    object: u64,
    name: &str,
) -> EventRecord {
    let mut params = Params::new();
    params.append(ParamName::HandleId, ParamValue::U32(handle_id));
    params.append(ParamName::HandleObjectTypeId, ParamValue::U16(type_id));
    params.append(ParamName::HandleObject, ParamValue::Hex64(object));
    params.append(ParamName::HandleObjectName, ParamValue::Utf16Str(name.into()));
    EventRecord::new(header(kind, header_pid), params)
}

/// A file event that flows through every stage untouched, used to fence
/// assertions about preceding records.
fn fence_record(header_pid: u32) -> EventRecord {
    let mut params = Params::new();
    params.append(
        ParamName::FileName,
        ParamValue::FilePath("C:\\Windows\\Temp\\fence".into()),
    );
    EventRecord::new(header(EventKind::CreateFile, header_pid), params)
}

async fn recv(events: &mut tokio::sync::mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("events channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn create_process_is_published_enriched() {
    let h = harness(KstreamConfig::default());
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        process_record(
            EventKind::CreateProcess,
            4,
            100,
            4,
            "svchost.exe",
            "\"svchost.exe\" -k netsvcs",
        ),
    );

    let event = recv(&mut events).await;
    assert_eq!(event.kind, EventKind::CreateProcess);
    assert_eq!(event.seq, 1);
    assert_eq!(
        event.params.get_str(ParamName::Cmdline).unwrap(),
        "svchost.exe -k netsvcs"
    );
    assert!(event
        .params
        .get_str(ParamName::Exe)
        .unwrap()
        .ends_with("\\System32\\svchost.exe"));

    let record = h.psnap.find(100).unwrap();
    assert_eq!(record.ppid, 4);
    assert_eq!(h.metrics.kevents_enqueued.value(), 1);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn live_rundown_with_self_parent_is_inserted_but_not_published() {
    let h = harness(KstreamConfig::default());
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        process_record(
            EventKind::ProcessRundown,
            4,
            100,
            100,
            "weird.exe",
            "weird.exe",
        ),
    );
    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));

    let fence = recv(&mut events).await;
    assert_eq!(fence.kind, EventKind::CreateFile);
    // rundowns are state events: swallowed by the output, written to
    // the snapshot
    assert_eq!(h.psnap.size(), 1);
    assert!(h.psnap.find(100).is_some());

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn nameless_create_handle_is_published_once_completed() {
    let h = harness(KstreamConfig::default());
    h.type_store.register_type(12, otypes::KEY);
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        handle_record(EventKind::CreateHandle, 100, 44, 12, 0xabc, ""),
    );
    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        handle_record(
            EventKind::CloseHandle,
            100,
            44,
            12,
            0xabc,
            "\\REGISTRY\\MACHINE\\SOFTWARE\\X",
        ),
    );
    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));

    let completed = recv(&mut events).await;
    assert_eq!(completed.kind, EventKind::CreateHandle);
    assert_eq!(
        completed.params.get_str(ParamName::HandleObjectName).unwrap(),
        "HKLM\\SOFTWARE\\X"
    );
    // the close itself never surfaces
    let fence = recv(&mut events).await;
    assert_eq!(fence.kind, EventKind::CreateFile);

    assert_eq!(h.metrics.handle_deferred_matches.value(), 1);
    assert_eq!(h.metrics.upstream_cancellations.value(), 1);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn own_events_never_surface() {
    let h = harness(KstreamConfig::default());
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    let own_pid = std::process::id();
    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        process_record(
            EventKind::CreateProcess,
            own_pid,
            9000,
            own_pid,
            "kestrel.exe",
            "kestrel.exe run",
        ),
    );
    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));

    let fence = recv(&mut events).await;
    assert_eq!(fence.kind, EventKind::CreateFile);
    // dropped by the self filter, not the image filter
    assert_eq!(h.metrics.kevents_enqueued.value(), 1);
    assert_eq!(h.metrics.excluded_procs.value(), 0);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn excluded_images_are_counted_and_dropped() {
    let config = KstreamConfig {
        exclude_images: vec!["svchost.exe".into()],
        ..Default::default()
    };
    let h = harness(config);
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    // seed the snapshot so the producing pid resolves to svchost.exe
    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        process_record(
            EventKind::CreateProcess,
            4,
            100,
            4,
            "svchost.exe",
            "svchost.exe -k netsvcs",
        ),
    );
    // an event produced by the excluded process
    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(100));
    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));

    // the create itself surfaces: its producing pid is 4, not svchost
    let create = recv(&mut events).await;
    assert_eq!(create.kind, EventKind::CreateProcess);
    let fence = recv(&mut events).await;
    assert_eq!(fence.pid, 4);
    assert_eq!(h.metrics.excluded_procs.value(), 1);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn filter_consumes_events_without_burning_sequence_numbers() {
    let h = harness(KstreamConfig::default());
    h.consumer
        .set_filter(Some(Box::new(RejectKindsFilter(vec![
            EventKind::CreateThread,
        ]))));
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        process_record(
            EventKind::CreateProcess,
            4,
            100,
            4,
            "svchost.exe",
            "svchost.exe -k netsvcs",
        ),
    );
    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        thread_record(EventKind::CreateThread, 100, 100, 7),
    );
    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));

    let create = recv(&mut events).await;
    assert_eq!(create.seq, 1);
    let fence = recv(&mut events).await;
    assert_eq!(fence.kind, EventKind::CreateFile);
    // the rejected thread event consumed no sequence number
    assert_eq!(fence.seq, 2);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn filter_can_be_uninstalled_at_runtime() {
    let h = harness(KstreamConfig::default());
    h.consumer
        .set_filter(Some(Box::new(RejectKindsFilter(vec![EventKind::CreateFile]))));
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));
    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        thread_record(EventKind::CreateThread, 100, 100, 7),
    );
    let thread = recv(&mut events).await;
    assert_eq!(thread.kind, EventKind::CreateThread);

    h.consumer.set_filter(None);
    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));
    let fence = recv(&mut events).await;
    assert_eq!(fence.kind, EventKind::CreateFile);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn excluded_kinds_are_counted() {
    let config = KstreamConfig {
        exclude_kevents: vec![EventKind::CreateFile],
        ..Default::default()
    };
    let h = harness(config);
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));
    h.trace_api.feed(
        KERNEL_LOGGER_SESSION,
        thread_record(EventKind::CreateThread, 100, 100, 7),
    );
    let thread = recv(&mut events).await;
    assert_eq!(thread.kind, EventKind::CreateThread);
    assert_eq!(h.metrics.excluded_kevents.value(), 1);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn kernel_logger_open_failure_fails_the_call() {
    let h = harness(KstreamConfig::default());
    h.trace_api.fail_open(KERNEL_LOGGER_SESSION);
    assert!(h.consumer.open_kstream().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn auxiliary_open_failure_is_skipped() {
    let config = KstreamConfig {
        sessions: vec![
            TraceSessionConfig::kernel_logger(),
            TraceSessionConfig::auxiliary("Kestrel Audit"),
        ],
        ..Default::default()
    };
    let h = harness(config);
    h.trace_api.fail_open("Kestrel Audit");
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));
    let fence = recv(&mut events).await;
    assert_eq!(fence.kind, EventKind::CreateFile);

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn event_callback_bypasses_the_channel() {
    let h = harness(KstreamConfig::default());
    let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.consumer.set_event_callback(Box::new(move |event| {
        sink.lock().unwrap().push(event);
        Ok(())
    }));
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("callback never fired");

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(events.try_recv().is_err());

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn full_output_channel_applies_backpressure() {
    let h = harness(KstreamConfig::default());
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    let total = 550u32;
    for _ in 0..total {
        h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    // the callback thread is parked on the full channel, so the buffer
    // counter stalls below the fed total
    let stalled = h.metrics.kbuffers_read.value();
    assert!(stalled < i64::from(total), "no backpressure: {stalled}");

    let mut previous = 0;
    for _ in 0..total {
        let event = recv(&mut events).await;
        assert!(event.seq > previous, "sequence went backwards");
        previous = event.seq;
    }
    // the last enqueue is counted on the callback thread right after the
    // send completes
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.metrics.kevents_enqueued.value(), i64::from(total));

    h.consumer.close_kstream().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn delivered_sequence_numbers_are_strictly_monotonic() {
    let h = harness(KstreamConfig::default());
    h.consumer.open_kstream().unwrap();
    let mut events = h.consumer.events();

    for _ in 0..10 {
        h.trace_api.feed(KERNEL_LOGGER_SESSION, fence_record(4));
    }
    for expected in 1..=10u64 {
        assert_eq!(recv(&mut events).await.seq, expected);
    }

    h.consumer.close_kstream().unwrap();
}
