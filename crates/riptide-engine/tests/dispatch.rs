//! End-to-end tests for the dispatcher: operation graphs, completion
//! ordering, failure propagation, and handle lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::tempdir;

use riptide_engine::{
    when_all, when_all_settled, CompletionRequest, DataRequest, Dispatcher, FileFlags, HandleKind,
    IoBuf, IoError, OpId, PathRequest,
};

fn dispatcher() -> Arc<Dispatcher> {
    Dispatcher::from_current_runtime(FileFlags::empty(), FileFlags::empty())
}

/// Waits for every in-flight operation (including transparently chained
/// ones) to retire from the operation table.
async fn drain(dispatcher: &Dispatcher) {
    for _ in 0..400 {
        if dispatcher.wait_queue_depth() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "operation table did not drain: {} operations still in flight",
        dispatcher.wait_queue_depth()
    );
}

#[tokio::test]
async fn test_write_close_reopen_read_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blob.bin");
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        &path,
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);
    let written = dispatcher.write(vec![DataRequest::new(
        &opened[0],
        0,
        vec![IoBuf::from(vec![0xDE, 0xAD, 0xBE, 0xEF])],
    )]);
    let closed = dispatcher.close(vec![written[0].clone()]);
    closed[0].result().await.unwrap();

    let reopened = dispatcher.file(vec![PathRequest::new(&path, FileFlags::READ)]);
    let buf = IoBuf::zeroed(4);
    let read = dispatcher.read(vec![DataRequest::new(&reopened[0], 0, vec![buf.clone()])]);
    let handle = read[0].result().await.unwrap();

    assert_eq!(buf.to_vec(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(handle.read_count(), 4);

    dispatcher.close(vec![read[0].clone()])[0].result().await.unwrap();
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_nested_directories_then_file() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let a = tmp.path().join("a");
    let b = a.join("b");
    let c = b.join("c");

    let dir_a = dispatcher.dir(vec![PathRequest::new(&a, FileFlags::CREATE)]);
    let dir_b = dispatcher.dir(vec![PathRequest::after(&dir_a[0], &b, FileFlags::CREATE)]);
    let file = dispatcher.file(vec![PathRequest::after(
        &dir_b[0],
        &c,
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);
    let written = dispatcher.write(vec![DataRequest::new(
        &file[0],
        0,
        vec![IoBuf::from(vec![0x01, 0x02, 0x03])],
    )]);
    let closed = dispatcher.close(vec![written[0].clone()]);
    closed[0].result().await.unwrap();

    let reopened = dispatcher.file(vec![PathRequest::new(&c, FileFlags::READ)]);
    let buf = IoBuf::zeroed(3);
    let read = dispatcher.read(vec![DataRequest::new(&reopened[0], 0, vec![buf.clone()])]);
    read[0].result().await.unwrap();
    assert_eq!(buf.to_vec(), vec![0x01, 0x02, 0x03]);

    dispatcher.close(vec![read[0].clone()])[0].result().await.unwrap();
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_hundred_independent_creates() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let reqs: Vec<PathRequest> = (0..100)
        .map(|i| {
            PathRequest::new(
                tmp.path().join(format!("f{i:03}.bin")),
                FileFlags::CREATE | FileFlags::WRITE,
            )
        })
        .collect();
    let ops = dispatcher.file(reqs);
    assert_eq!(ops.len(), 100);

    let handles = when_all(&ops).await.unwrap();
    assert_eq!(handles.len(), 100);
    assert_eq!(dispatcher.count(), 100);

    for handle in &handles {
        assert!(handle.native().is_some());
        assert!(
            dispatcher.registry().get(handle.native().unwrap()).is_some(),
            "registry lookup failed for {}",
            handle.path().display()
        );
    }

    drain(&dispatcher).await;
    drop(handles);
    drop(ops);
    assert_eq!(dispatcher.count(), 0);
}

#[tokio::test]
async fn test_dependents_run_after_preconditions() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();
    let log: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

    let file = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("ordered.bin"),
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);

    let mut previous = file[0].clone();
    for name in ["a", "b", "c"] {
        let log = Arc::clone(&log);
        let step = dispatcher.completion(vec![CompletionRequest::new(
            Some(previous.clone()),
            move |_, handle| {
                log.lock().push((name, Instant::now()));
                std::thread::sleep(Duration::from_millis(20));
                log.lock().push((name, Instant::now()));
                handle.ok_or_else(|| IoError::task("precondition yielded no handle"))
            },
        )]);
        previous = step[0].clone();
    }
    previous.result().await.unwrap();

    let log = log.lock();
    let names: Vec<&str> = log.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, ["a", "a", "b", "b", "c", "c"]);
    // Each dependent started at or after its precondition finished.
    assert!(log[2].1 >= log[1].1);
    assert!(log[4].1 >= log[3].1);
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_wait_queue_depth_returns_to_zero() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();
    assert_eq!(dispatcher.wait_queue_depth(), 0);

    let opened = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("depth.bin"),
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);
    let written = dispatcher.write(vec![DataRequest::new(
        &opened[0],
        0,
        vec![IoBuf::from(vec![7u8; 64])],
    )]);
    let synced = dispatcher.sync(vec![written[0].clone()]);
    let closed = dispatcher.close(vec![synced[0].clone()]);

    closed[0].result().await.unwrap();
    drain(&dispatcher).await;
    assert_eq!(dispatcher.wait_queue_depth(), 0);
}

#[tokio::test]
async fn test_failed_precondition_hands_dependent_no_handle() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    // Open without CREATE on a missing path fails.
    let missing = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("does-not-exist.bin"),
        FileFlags::READ,
    )]);

    let invocations = Arc::new(Mutex::new(0u32));
    let seen = Arc::clone(&invocations);
    let dependent = dispatcher.completion(vec![CompletionRequest::new(
        Some(missing[0].clone()),
        move |_, handle| {
            *seen.lock() += 1;
            assert!(handle.is_none());
            Err(IoError::task("nothing to pass on"))
        },
    )]);

    let first = missing[0].result().await;
    assert!(matches!(first, Err(ref e) if e.is_not_found()));

    let second = dependent[0].result().await;
    assert!(matches!(second, Err(IoError::Task { .. })));
    assert_eq!(*invocations.lock(), 1);
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_user_completion_receives_preconditions_handle() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("cb.bin"),
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);
    let observed = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&observed);
    let completion = dispatcher.completion(vec![CompletionRequest::new(
        Some(opened[0].clone()),
        move |_, handle| {
            let handle = handle.expect("open succeeded");
            *slot.lock() = Some(Arc::clone(&handle));
            Ok(handle)
        },
    )]);

    let from_open = opened[0].result().await.unwrap();
    let from_completion = completion[0].result().await.unwrap();

    let seen = observed.lock().clone().expect("callback ran");
    assert!(Arc::ptr_eq(&from_open, &seen));
    assert!(Arc::ptr_eq(&from_open, &from_completion));
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_deferred_completion_waits_for_complete_call() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("deferred.bin"),
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);
    let handle = opened[0].result().await.unwrap();

    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    let h = Arc::clone(&handle);
    let deferred = dispatcher.completion(vec![CompletionRequest::deferred(None, move |_, _| {
        *flag.lock() = true;
        Ok(h)
    })]);

    // Give the callback time to run; the future must stay pending.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(*ran.lock());
    assert!(deferred[0].try_result().is_none());

    dispatcher
        .complete(deferred[0].id(), Ok(Arc::clone(&handle)))
        .unwrap();
    let resolved = deferred[0].result().await.unwrap();
    assert!(Arc::ptr_eq(&resolved, &handle));

    // A second completion finds the operation gone.
    let err = dispatcher
        .complete(deferred[0].id(), Ok(Arc::clone(&handle)))
        .unwrap_err();
    assert!(matches!(err, IoError::UnknownOp { .. }));
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_complete_rejects_non_deferred_operations() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let gate: Arc<Mutex<()>> = Arc::new(Mutex::new(()));
    let held = gate.lock();

    let blocker = Arc::clone(&gate);
    let slow = dispatcher.completion(vec![CompletionRequest::new(None, move |_, _| {
        drop(blocker.lock());
        Err(IoError::task("done"))
    })]);

    // The operation is still in flight while the gate is held.
    let handle_source = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("x.bin"),
        FileFlags::CREATE | FileFlags::WRITE,
    )]);
    let handle = handle_source[0].result().await.unwrap();

    let err = dispatcher.complete(slow[0].id(), Ok(handle)).unwrap_err();
    assert!(matches!(err, IoError::NotDeferred { .. }));

    drop(held);
    let _ = slow[0].result().await;

    let unknown = dispatcher.complete(OpId::new(0xFFFF_FFFF), Err(IoError::Dropped));
    assert!(matches!(unknown, Err(IoError::UnknownOp { .. })));
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_autoflush_write_sync_write_close() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("durable.bin");
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        &path,
        FileFlags::CREATE | FileFlags::READ_WRITE | FileFlags::AUTO_FLUSH,
    )]);
    let first = dispatcher.write(vec![DataRequest::new(
        &opened[0],
        0,
        vec![IoBuf::from(vec![0xAA; 1024])],
    )]);
    let synced = dispatcher.sync(vec![first[0].clone()]);
    let second = dispatcher.write(vec![DataRequest::new(
        &synced[0],
        1024,
        vec![IoBuf::from(vec![0xBB; 1024])],
    )]);
    let closed = dispatcher.close(vec![second[0].clone()]);

    let file_handle = second[0].result().await.unwrap();
    assert_eq!(file_handle.path(), path);
    assert_eq!(file_handle.write_count(), 2048);

    // The file was fsynced, so on POSIX the close descriptor stands for
    // the chained directory-close.
    let closed_handle = closed[0].result().await.unwrap();
    #[cfg(unix)]
    assert_eq!(closed_handle.path(), tmp.path());
    #[cfg(windows)]
    {
        assert_eq!(closed_handle.path(), path);
        assert_eq!(closed_handle.kind(), HandleKind::File);
    }

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 2048);
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_close_without_writes_skips_sync() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("untouched.bin"),
        FileFlags::CREATE | FileFlags::WRITE | FileFlags::AUTO_FLUSH,
    )]);
    let closed = dispatcher.close(vec![opened[0].clone()]);
    let handle = closed[0].result().await.unwrap();

    assert_eq!(handle.write_count(), 0);
    assert_eq!(handle.write_count_since_sync(), 0);
    drain(&dispatcher).await;
    // Never fsynced, so no containing-directory chain was appended.
    assert_eq!(dispatcher.wait_queue_depth(), 0);
}

#[tokio::test]
async fn test_create_only_if_not_exist_on_existing_directory() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("once");
    let dispatcher = dispatcher();

    let first = dispatcher.dir(vec![PathRequest::new(&path, FileFlags::CREATE)]);
    first[0].result().await.unwrap();

    let exclusive = dispatcher.dir(vec![PathRequest::new(
        &path,
        FileFlags::CREATE | FileFlags::CREATE_ONLY_IF_NOT_EXIST,
    )]);
    let err = exclusive[0].result().await.unwrap_err();
    assert!(err.is_already_exists());

    // Plain CREATE tolerates the existing directory.
    let tolerant = dispatcher.dir(vec![PathRequest::new(&path, FileFlags::CREATE)]);
    tolerant[0].result().await.unwrap();
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_dir_create_over_file_reports_not_a_directory() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("file-in-the-way");
    std::fs::write(&path, b"occupied").unwrap();
    let dispatcher = dispatcher();

    let op = dispatcher.dir(vec![PathRequest::new(&path, FileFlags::empty())]);
    let err = op[0].result().await.unwrap_err();
    assert!(matches!(err, IoError::NotADirectory { .. }));
    drain(&dispatcher).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_fsynced_close_chains_containing_directory_sync() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("synced.bin");
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        &path,
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);
    let written = dispatcher.write(vec![DataRequest::new(
        &opened[0],
        0,
        vec![IoBuf::from(vec![1u8; 16])],
    )]);
    let synced = dispatcher.sync(vec![written[0].clone()]);
    synced[0].result().await.unwrap();

    let closed = dispatcher.close(vec![synced[0].clone()]);
    // The returned descriptor is the final directory-close: it resolves
    // to the containing directory's handle.
    let handle = closed[0].result().await.unwrap();
    assert_eq!(handle.path(), tmp.path());
    assert_eq!(handle.kind(), HandleKind::Directory);

    // The chained directory open/sync/close all retire as well.
    drain(&dispatcher).await;
    drop(handle);
    drop((opened, written, synced, closed));
    assert_eq!(dispatcher.count(), 0);
}

#[tokio::test]
async fn test_futures_are_shareable_and_single_shot() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("shared.bin"),
        FileFlags::CREATE | FileFlags::WRITE,
    )]);

    let descriptor = opened[0].clone();
    let concurrent = tokio::spawn(async move { descriptor.result().await });

    let first = opened[0].result().await.unwrap();
    let second = opened[0].result().await.unwrap();
    let third = concurrent.await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert!(opened[0].try_result().is_some());
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_remove_operations() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let file_path = tmp.path().join("victim.bin");
    let dir_path = tmp.path().join("victim-dir");

    let created = dispatcher.file(vec![PathRequest::new(
        &file_path,
        FileFlags::CREATE | FileFlags::WRITE,
    )]);
    let closed = dispatcher.close(vec![created[0].clone()]);
    closed[0].result().await.unwrap();
    let made = dispatcher.dir(vec![PathRequest::new(&dir_path, FileFlags::CREATE)]);
    made[0].result().await.unwrap();

    let rm_file = dispatcher.rmfile(vec![PathRequest::new(&file_path, FileFlags::empty())]);
    let rm_dir = dispatcher.rmdir(vec![PathRequest::new(&dir_path, FileFlags::empty())]);
    rm_file[0].result().await.unwrap();
    rm_dir[0].result().await.unwrap();

    assert!(!file_path.exists());
    assert!(!dir_path.exists());

    let again = dispatcher.rmfile(vec![PathRequest::new(&file_path, FileFlags::empty())]);
    assert!(again[0].result().await.unwrap_err().is_not_found());
    drain(&dispatcher).await;
}

#[tokio::test]
async fn test_scatter_gather_segments() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher();

    let opened = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("vectored.bin"),
        FileFlags::CREATE | FileFlags::READ_WRITE,
    )]);
    let written = dispatcher.write(vec![DataRequest::new(
        &opened[0],
        0,
        vec![
            IoBuf::from(vec![1u8, 2]),
            IoBuf::from(vec![3u8]),
            IoBuf::from(vec![4u8, 5, 6]),
        ],
    )]);
    written[0].result().await.unwrap();

    let first = IoBuf::zeroed(4);
    let second = IoBuf::zeroed(2);
    let read = dispatcher.read(vec![DataRequest::new(
        &written[0],
        0,
        vec![first.clone(), second.clone()],
    )]);
    let handle = read[0].result().await.unwrap();

    assert_eq!(first.to_vec(), vec![1, 2, 3, 4]);
    assert_eq!(second.to_vec(), vec![5, 6]);
    assert_eq!(handle.write_count(), 6);
    assert_eq!(handle.read_count(), 6);
    drain(&dispatcher).await;
}

/// The same independent batch yields the same set of outcomes regardless
/// of how many workers the pool runs.
#[test]
fn test_results_independent_of_worker_count() {
    for workers in [1usize, 4] {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let tmp = tempdir().unwrap();
            let dispatcher = Dispatcher::from_current_runtime(
                FileFlags::empty(),
                FileFlags::empty(),
            );
            let reqs: Vec<PathRequest> = (0..20)
                .map(|i| {
                    PathRequest::new(
                        tmp.path().join(format!("w{i}.bin")),
                        FileFlags::CREATE | FileFlags::WRITE,
                    )
                })
                .collect();
            let ops = dispatcher.file(reqs);
            let outcomes = when_all_settled(&ops).await;
            assert_eq!(outcomes.len(), 20);
            for outcome in outcomes {
                outcome.unwrap();
            }
        });
    }
}

#[tokio::test]
async fn test_forced_flags_are_applied() {
    let tmp = tempdir().unwrap();
    let dispatcher = Dispatcher::from_current_runtime(
        FileFlags::AUTO_FLUSH,
        FileFlags::empty(),
    );

    assert!(dispatcher
        .file_flags(FileFlags::WRITE)
        .contains(FileFlags::AUTO_FLUSH | FileFlags::WRITE));

    let opened = dispatcher.file(vec![PathRequest::new(
        tmp.path().join("forced.bin"),
        FileFlags::CREATE | FileFlags::WRITE,
    )]);
    let handle = opened[0].result().await.unwrap();
    assert!(handle.flags().contains(FileFlags::AUTO_FLUSH));
    drain(&dispatcher).await;
}
