// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::{
    bail,
    Result,
};
use ::clap::{
    Arg,
    ArgAction,
    ArgMatches,
    Command,
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
    str::FromStr,
    sync::Arc,
    time::Instant,
};

//==============================================================================
// Program Arguments
//==============================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Local IPv4 address the server listens on and the readers connect to.
    addr: Ipv4Addr,
    /// TCP port.
    port: u16,
    /// Number of concurrent readers.
    readers: usize,
    /// Bytes each reader drains before closing its stream.
    bytes: u64,
    /// Number of worker threads draining the completion queue. When absent,
    /// derived from the reader count.
    threads: Option<usize>,
    /// Completes ready operations at issue time instead of through the queue.
    sync: bool,
}

/// Associate functions for Program Arguments
impl ProgramArguments {
    /// Default host address.
    const DEFAULT_ADDR: &'static str = "127.0.0.1";
    /// Default bytes per reader.
    const DEFAULT_BYTES: u64 = 1_000_000_000;
    /// Default TCP port.
    const DEFAULT_PORT: u16 = 13;
    /// Default reader count.
    const DEFAULT_READERS: usize = 1;
    /// Worker threads beyond two per reader.
    const EXTRA_THREADS: usize = 8;

    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("addr")
                    .long("addr")
                    .value_parser(clap::value_parser!(String))
                    .value_name("ADDRESS")
                    .help("Sets IPv4 address"),
            )
            .arg(
                Arg::new("port")
                    .long("port")
                    .value_parser(clap::value_parser!(String))
                    .value_name("PORT")
                    .help("Sets TCP port"),
            )
            .arg(
                Arg::new("readers")
                    .long("readers")
                    .value_parser(clap::value_parser!(String))
                    .value_name("COUNT")
                    .help("Sets number of concurrent readers"),
            )
            .arg(
                Arg::new("bytes")
                    .long("bytes")
                    .value_parser(clap::value_parser!(String))
                    .value_name("BYTES")
                    .help("Sets bytes drained per reader"),
            )
            .arg(
                Arg::new("threads")
                    .long("threads")
                    .value_parser(clap::value_parser!(String))
                    .value_name("COUNT")
                    .help("Sets number of worker threads"),
            )
            .arg(
                Arg::new("sync")
                    .long("sync")
                    .action(ArgAction::SetTrue)
                    .help("Completes ready operations at issue time"),
            )
            .get_matches();

        // Default arguments.
        let mut args: ProgramArguments = ProgramArguments {
            addr: Ipv4Addr::from_str(Self::DEFAULT_ADDR)?,
            port: Self::DEFAULT_PORT,
            readers: Self::DEFAULT_READERS,
            bytes: Self::DEFAULT_BYTES,
            threads: None,
            sync: false,
        };

        // Address.
        if let Some(addr) = matches.get_one::<String>("addr") {
            args.set_addr(addr)?;
        }

        // Port.
        if let Some(port) = matches.get_one::<String>("port") {
            args.set_port(port)?;
        }

        // Reader count.
        if let Some(readers) = matches.get_one::<String>("readers") {
            args.set_readers(readers)?;
        }

        // Bytes per reader.
        if let Some(bytes) = matches.get_one::<String>("bytes") {
            args.set_bytes(bytes)?;
        }

        // Worker thread count.
        if let Some(threads) = matches.get_one::<String>("threads") {
            args.set_threads(threads)?;
        }

        // Synchronous completion.
        if matches.get_flag("sync") {
            args.sync = true;
        }

        Ok(args)
    }

    /// Returns the address parameter stored in the target program arguments.
    pub fn get_addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Returns the port parameter stored in the target program arguments.
    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// Returns the reader count parameter stored in the target program
    /// arguments.
    pub fn get_readers(&self) -> usize {
        self.readers
    }

    /// Returns the per-reader byte budget stored in the target program
    /// arguments.
    pub fn get_bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns the worker thread count, deriving it from the reader count
    /// when no explicit value was given.
    pub fn get_threads(&self) -> usize {
        self.threads.unwrap_or(self.readers * 2 + Self::EXTRA_THREADS)
    }

    /// Returns the synchronous completion parameter stored in the target
    /// program arguments.
    pub fn get_sync(&self) -> bool {
        self.sync
    }

    /// Sets the address parameter in the target program arguments.
    fn set_addr(&mut self, addr_str: &str) -> Result<()> {
        self.addr = Ipv4Addr::from_str(addr_str)?;
        Ok(())
    }

    /// Sets the port parameter in the target program arguments.
    fn set_port(&mut self, port_str: &str) -> Result<()> {
        let port: u16 = port_str.parse()?;
        if port > 0 {
            self.port = port;
            Ok(())
        } else {
            bail!("invalid port")
        }
    }

    /// Sets the reader count parameter in the target program arguments.
    fn set_readers(&mut self, readers_str: &str) -> Result<()> {
        let readers: usize = readers_str.parse()?;
        if readers > 0 {
            self.readers = readers;
            Ok(())
        } else {
            bail!("invalid reader count")
        }
    }

    /// Sets the per-reader byte budget parameter in the target program
    /// arguments.
    fn set_bytes(&mut self, bytes_str: &str) -> Result<()> {
        let bytes: u64 = bytes_str.parse()?;
        if bytes > 0 {
            self.bytes = bytes;
            Ok(())
        } else {
            bail!("invalid byte budget")
        }
    }

    /// Sets the worker thread count parameter in the target program
    /// arguments.
    fn set_threads(&mut self, threads_str: &str) -> Result<()> {
        let threads: usize = threads_str.parse()?;
        if threads > 0 {
            self.threads = Some(threads);
            Ok(())
        } else {
            bail!("invalid thread count")
        }
    }
}

//==============================================================================
// Server
//==============================================================================

/// Accepting side. Every accepted stream gets a writer; the accept is then
/// re-armed on the same worker, so one accept is outstanding at all times.
struct Server {
    /// Listening socket.
    listener: Listener,
}

/// Associated Functions for the Server
impl Server {
    /// Arms the first accept. From here on the server is owned by its own
    /// pending operation: the armed continuation holds the only reference
    /// that has to stay alive.
    pub fn start(listener: Listener) {
        let server: Arc<Server> = Arc::new(Server { listener });
        server.arm();
    }

    /// Arms the next accept.
    fn arm(self: &Arc<Self>) {
        let server: Arc<Server> = self.clone();
        match self.listener.accept_with(move |incoming| server.on_accepted(incoming)) {
            OpStart::Pending => (),
            OpStart::Failed(e) if e.errno == libc::ESHUTDOWN => (),
            OpStart::Failed(e) => eprintln!("failed to arm accept: {:?}", e),
            OpStart::CompletedInline(_) => panic!("unexpected result"),
        }
    }

    /// One delivered accept: hand the stream to a writer and re-arm.
    fn on_accepted(self: &Arc<Self>, incoming: Result<Connection, Fail>) {
        match incoming {
            Ok(conn) => {
                Writer::start(conn);
                self.arm();
            },
            Err(e) if e.errno == libc::ESHUTDOWN => (),
            Err(e) => {
                eprintln!("accept failed: {:?}", e);
                self.arm();
            },
        }
    }
}

//==============================================================================
// Writer
//==============================================================================

/// Sending side of one accepted stream. Keeps exactly one send outstanding,
/// reissuing from each delivered completion until the peer tears the stream
/// down.
struct Writer {
    /// The accepted stream.
    conn: Connection,
}

/// Associated Functions for the Writer
impl Writer {
    /// Payload fill byte.
    const FILL_CHAR: u8 = 0x65;

    /// Starts the send loop. Like the server, the writer is owned by its
    /// pending operation. A first send that finishes inline is reposted so
    /// the loop always advances from a worker thread.
    pub fn start(conn: Connection) {
        let writer: Arc<Writer> = Arc::new(Writer { conn });
        let handler: Arc<Writer> = writer.clone();
        let payload: Vec<u8> = mkbuf(BUFFER_SIZE, Self::FILL_CHAR);
        match writer.conn.write_with(payload, move |error, bytes| handler.on_sent(error, bytes)) {
            OpStart::Pending => (),
            OpStart::CompletedInline(bytes) => writer.bootstrap(bytes),
            OpStart::Failed(e) => writer.finish(&e),
        }
    }

    /// Hops onto a worker thread after an inline first send.
    fn bootstrap(self: &Arc<Self>, bytes: u32) {
        let handler: Arc<Writer> = self.clone();
        if let Err(e) = self.conn.repost_write(bytes, move |error, bytes| handler.on_sent(error, bytes)) {
            self.finish(&e);
        }
    }

    /// One delivered send completion: reissue until the next one parks.
    fn on_sent(self: &Arc<Self>, error: i32, _bytes: u32) {
        if error != 0 {
            self.finish(&Fail::new(error, "send failed"));
            return;
        }
        loop {
            let payload: Vec<u8> = match self.conn.take_write_buffer() {
                Some(payload) => payload,
                None => mkbuf(BUFFER_SIZE, Self::FILL_CHAR),
            };
            let handler: Arc<Writer> = self.clone();
            match self.conn.write_with(payload, move |error, bytes| handler.on_sent(error, bytes)) {
                OpStart::Pending => return,
                OpStart::CompletedInline(_) => continue,
                OpStart::Failed(e) => {
                    self.finish(&e);
                    return;
                },
            }
        }
    }

    /// Ends the send loop. A reset or broken pipe is the peer closing after
    /// draining its share; the queue shutting down ends the loop the same
    /// quiet way. Anything else is reported.
    fn finish(&self, cause: &Fail) {
        if cause.is_normal_termination() || cause.errno == libc::ESHUTDOWN {
            return;
        }
        eprintln!("writer failed: {:?}", cause);
    }
}

//==============================================================================
// Application
//==============================================================================

/// Application
struct Application {
    /// Shared completion queue driving all I/O.
    queue: SharedCompletionQueue,
    /// Endpoint the readers connect to.
    remote: Endpoint,
    /// Number of concurrent readers.
    readers: usize,
    /// Bytes each reader drains.
    bytes: u64,
}

/// Associated Functions for the Application
impl Application {
    /// Instantiates the application: queue, listener, and accept loop.
    pub fn new(args: &ProgramArguments) -> Result<Self> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(args.get_threads(), args.get_sync());
        let local: Endpoint = Endpoint::new(args.get_addr(), args.get_port());
        let listener: Listener = Listener::create(&queue, &local)?;
        Server::start(listener);

        Ok(Self {
            queue,
            remote: local,
            readers: args.get_readers(),
            bytes: args.get_bytes(),
        })
    }

    /// Runs the benchmark: spawn the readers, wait for the queue to drain,
    /// report the measured time.
    pub fn run(&self) -> Result<()> {
        let tracker: Arc<WorkTracker> = Arc::new(WorkTracker::new(self.readers, self.queue.clone()));
        let start: Instant = Instant::now();

        for _ in 0..self.readers {
            let queue: SharedCompletionQueue = self.queue.clone();
            let remote: Endpoint = self.remote;
            let budget: u64 = self.bytes;
            let tracker: Arc<WorkTracker> = tracker.clone();
            task::spawn(async move {
                match drain(queue, remote, budget).await {
                    Ok(_) => tracker.completed(),
                    Err(e) => {
                        eprintln!("reader failed: {:?}", e);
                        tracker.failed(e);
                    },
                }
            });
        }

        self.queue.wait();

        let seconds: f64 = start.elapsed().as_secs_f64();
        let total: f64 = (self.readers as u64).saturating_mul(self.bytes) as f64;
        println!("Measured: {:.6} seconds. {:.3} MB/s", seconds, total / seconds / 1e6);
        Ok(())
    }
}

//==============================================================================

/// Size of reader and writer buffers (in bytes).
const BUFFER_SIZE: usize = 4096;

/// Makes a buffer.
fn mkbuf(bufsize: usize, fill_char: u8) -> Vec<u8> {
    let mut data: Vec<u8> = Vec::<u8>::with_capacity(bufsize);

    for _ in 0..bufsize {
        data.push(fill_char);
    }

    data
}

/// Connects to the server and drains `budget` bytes. End of stream before
/// the budget is reached ends the reader the same way.
async fn drain(queue: SharedCompletionQueue, remote: Endpoint, budget: u64) -> Result<u64, Fail> {
    let conn: Connection = Connection::connect(&queue, remote).await?;
    let mut received: u64 = 0;
    let mut buffer: Vec<u8> = mkbuf(BUFFER_SIZE, 0);

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

/// Drives the application.
fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "tcp-load",
        "Pedro Henrique Penna <ppenna@microsoft.com>",
        "Measures how fast concurrent readers drain a completion-driven TCP server",
    )?;

    Application::new(&args)?.run()
}
