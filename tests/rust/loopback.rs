// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::ringport::{
    runtime::task,
    Connection,
    Endpoint,
    Fail,
    Listener,
    OpStart,
    SharedCompletionQueue,
    WorkTracker,
};
use ::std::{
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// Size of reader and writer buffers (in bytes).
const BUFFER_SIZE: usize = 4096;

/// Bytes each reader drains before closing its stream.
const READER_BUDGET: u64 = 1_048_576;

/// Worker threads draining the completion queue.
const WORKER_THREADS: usize = 4;

//==============================================================================
// Helper Functions
//==============================================================================

/// Serves accepted streams: each one gets its own writer task. Ends when an
/// accept can no longer be issued.
async fn serve(listener: Listener) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                task::spawn(write_stream(conn));
            },
            Err(_) => break,
        }
    }
}

/// Pumps payload into one accepted stream until the peer tears it down.
async fn write_stream(conn: Connection) {
    let mut payload: Vec<u8> = vec![0x65; BUFFER_SIZE];
    loop {
        match conn.send(payload).await {
            Ok((_, buffer)) => payload = buffer,
            Err(_) => break,
        }
    }
}

/// Connects to the server and drains `budget` bytes.
async fn read_stream(queue: SharedCompletionQueue, remote: Endpoint, budget: u64) -> Result<u64, Fail> {
    let conn: Connection = Connection::connect(&queue, remote).await?;
    let mut received: u64 = 0;
    let mut buffer: Vec<u8> = vec![0; BUFFER_SIZE];

    while received < budget {
        let (bytes, payload): (u32, Vec<u8>) = conn.receive(buffer).await?;
        if bytes == 0 {
            break;
        }
        received += u64::from(bytes);
        buffer = payload;
    }

    Ok(received)
}

//==============================================================================
// test_loopback_drain()
//==============================================================================

/// Runs a full loopback benchmark pass: a serving task accepting streams and
/// pumping payload, `readers` reader tasks draining their budgets, and the
/// work tracker stopping the queue once every reader reported. The test
/// thread blocks in `wait()` exactly like the benchmark binary does.
fn do_test_loopback_drain(readers: usize, sync: bool) -> Result<()> {
    let queue: SharedCompletionQueue = SharedCompletionQueue::create(WORKER_THREADS, sync);
    let listener: Listener = Listener::create(&queue, &Endpoint::new(Ipv4Addr::LOCALHOST, 0))?;
    let remote: Endpoint = listener.local_endpoint()?;
    task::spawn(serve(listener));

    let tracker: Arc<WorkTracker> = Arc::new(WorkTracker::new(readers, queue.clone()));
    let (tx, rx): (Sender<u64>, Receiver<u64>) = unbounded();
    for _ in 0..readers {
        let queue: SharedCompletionQueue = queue.clone();
        let tracker: Arc<WorkTracker> = tracker.clone();
        let tx: Sender<u64> = tx.clone();
        task::spawn(async move {
            match read_stream(queue, remote, READER_BUDGET).await {
                Ok(total) => {
                    let _ = tx.send(total);
                    tracker.completed();
                },
                Err(e) => tracker.failed(e),
            }
        });
    }

    queue.wait();

    let totals: Vec<u64> = rx.try_iter().collect();
    if totals.len() != readers {
        anyhow::bail!("expected {:?} readers to finish, got {:?}", readers, totals.len());
    }
    if totals.iter().any(|total| *total < READER_BUDGET) {
        anyhow::bail!("a reader fell short of its budget: {:?}", totals);
    }

    Ok(())
}

/// Tests a full loopback pass with one reader and queued completions.
#[test]
fn test_loopback_drain_single_queued() -> Result<()> {
    do_test_loopback_drain(1, false)
}

/// Tests a full loopback pass with one reader and synchronous completion of
/// ready operations.
#[test]
fn test_loopback_drain_single_synchronous() -> Result<()> {
    do_test_loopback_drain(1, true)
}

/// Tests a full loopback pass with several concurrent readers.
#[test]
fn test_loopback_drain_many_queued() -> Result<()> {
    do_test_loopback_drain(3, false)
}

//==============================================================================
// test_loopback_callback_writer()
//==============================================================================

/// Sending side of one accepted stream, in the explicit continuation style:
/// each delivered completion reissues until a send parks, and a first send
/// that finishes inline is reposted onto a worker thread.
struct PumpWriter {
    /// The accepted stream.
    conn: Connection,
}

impl PumpWriter {
    /// Starts the send loop on an accepted stream.
    fn start(conn: Connection) {
        let writer: Arc<PumpWriter> = Arc::new(PumpWriter { conn });
        let handler: Arc<PumpWriter> = writer.clone();
        let payload: Vec<u8> = vec![0x65; BUFFER_SIZE];
        match writer.conn.write_with(payload, move |error, bytes| handler.on_sent(error, bytes)) {
            OpStart::Pending => (),
            OpStart::CompletedInline(bytes) => {
                let handler: Arc<PumpWriter> = writer.clone();
                let _ = writer.conn.repost_write(bytes, move |error, bytes| handler.on_sent(error, bytes));
            },
            OpStart::Failed(_) => (),
        }
    }

    /// One delivered send completion: reissue until the next one parks. The
    /// peer closing its end surfaces here as a delivered error or an issue
    /// failure; both end the loop.
    fn on_sent(self: &Arc<Self>, error: i32, _bytes: u32) {
        if error != 0 {
            return;
        }
        loop {
            let payload: Vec<u8> = match self.conn.take_write_buffer() {
                Some(payload) => payload,
                None => vec![0x65; BUFFER_SIZE],
            };
            let handler: Arc<PumpWriter> = self.clone();
            match self.conn.write_with(payload, move |error, bytes| handler.on_sent(error, bytes)) {
                OpStart::Pending | OpStart::Failed(_) => return,
                OpStart::CompletedInline(_) => continue,
            }
        }
    }
}

/// Runs a loopback pass with the serving side in the explicit continuation
/// style: the accept installs a handler that hands the stream to a
/// [PumpWriter], and the reader drains it through the suspension adapters.
/// Synchronous completion is on, so the writer's first send finishes inline
/// and the loop bootstraps through a reposted completion.
fn do_test_loopback_callback_writer() -> Result<()> {
    let queue: SharedCompletionQueue = SharedCompletionQueue::create(WORKER_THREADS, true);
    let listener: Listener = Listener::create(&queue, &Endpoint::new(Ipv4Addr::LOCALHOST, 0))?;
    let remote: Endpoint = listener.local_endpoint()?;

    let started: OpStart = listener.accept_with(move |incoming| {
        if let Ok(conn) = incoming {
            PumpWriter::start(conn);
        }
    });
    if !matches!(started, OpStart::Pending) {
        anyhow::bail!("expected a pending accept, got {:?}", started);
    }

    let tracker: Arc<WorkTracker> = Arc::new(WorkTracker::new(1, queue.clone()));
    let (tx, rx): (Sender<u64>, Receiver<u64>) = unbounded();
    {
        let queue: SharedCompletionQueue = queue.clone();
        let tracker: Arc<WorkTracker> = tracker.clone();
        task::spawn(async move {
            match read_stream(queue, remote, READER_BUDGET).await {
                Ok(total) => {
                    let _ = tx.send(total);
                    tracker.completed();
                },
                Err(e) => tracker.failed(e),
            }
        });
    }

    queue.wait();

    let total: u64 = rx.recv_timeout(Duration::from_secs(1))?;
    if total < READER_BUDGET {
        anyhow::bail!("the reader fell short of its budget: {:?}", total);
    }

    Ok(())
}

/// Tests a loopback pass whose serving side runs on explicit continuations.
#[test]
fn test_loopback_callback_writer() -> Result<()> {
    do_test_loopback_callback_writer()
}
