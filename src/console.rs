//! Operator console.
//!
//! Output goes through [`Console`], a cloneable handle over any writer, so
//! the HTTP handlers and the producer loop can share stdout (or a test
//! buffer). Input is read line by line on a dedicated OS thread and handed
//! to the async side over a channel; the blocking read never runs on the
//! event loop.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::slot::MessageSlot;

/// Lines buffered between the reader thread and the producer loop
const INPUT_QUEUE: usize = 64;

/// Pause after a failed read before trying again
const READ_ERROR_PAUSE: Duration = Duration::from_millis(500);

const PROMPT: &str = "> ";

/// Cloneable handle to the operator's output stream
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Console {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Startup lines describing where the service listens.
    pub fn banner(&self, addr: SocketAddr) {
        self.write(&format!(
            "Starting Poll Server at http://{addr}\n\
             Endpoints:\n  \
             GET  /messages  - Returns current message\n  \
             POST /response  - Receives AI answer\n"
        ));
    }

    pub fn intro(&self) {
        self.write("Type a message for the app and press Enter.\n");
    }

    pub fn prompt(&self) {
        self.write(PROMPT);
    }

    /// Confirm a message was queued for the next poll.
    pub fn queued(&self, text: &str) {
        self.write(&format!("[Queued]: '{text}' (waiting for app poll)\n{PROMPT}"));
    }

    /// Surface a response posted by the application.
    pub fn app_says(&self, text: &str) {
        self.write(&format!("\n[APP SAYS]: {text}\n\n{PROMPT}"));
    }

    // Blocks the calling task (HTTP handlers included) while the writer is
    // busy. A stalled terminal stalls request handling.
    fn write(&self, text: &str) {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            warn!(error = %e, "Console write failed");
        }
    }
}

/// One unit of operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Line(String),
    Eof,
}

/// Start the `console-reader` thread over `input`.
///
/// The thread is detached. It exits on end of input, or at the next line
/// after the receiving side has been dropped.
pub fn spawn_reader<R>(input: R) -> io::Result<mpsc::Receiver<ConsoleInput>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);
    thread::Builder::new()
        .name("console-reader".to_string())
        .spawn(move || read_lines(input, tx))?;
    Ok(rx)
}

fn read_lines<R: BufRead>(mut input: R, tx: mpsc::Sender<ConsoleInput>) {
    let mut line = String::new();

    loop {
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => {
                let _ = tx.blocking_send(ConsoleInput::Eof);
                return;
            }
            Ok(_) => {
                if tx.blocking_send(ConsoleInput::Line(line.clone())).is_err() {
                    debug!("Console consumer gone, reader exiting");
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "Input error");
                if tx.is_closed() {
                    return;
                }
                thread::sleep(READ_ERROR_PAUSE);
            }
        }
    }
}

/// Feeds operator lines into the message slot.
pub struct ConsoleProducer {
    slot: Arc<MessageSlot>,
    console: Console,
}

impl ConsoleProducer {
    pub fn new(slot: Arc<MessageSlot>, console: Console) -> Self {
        ConsoleProducer { slot, console }
    }

    /// Run until end of input or until `stop` flips to true.
    pub async fn run(
        self,
        mut input: mpsc::Receiver<ConsoleInput>,
        mut stop: watch::Receiver<bool>,
    ) {
        self.console.intro();
        self.console.prompt();

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                next = input.recv() => match next {
                    Some(ConsoleInput::Line(line)) => self.accept(&line),
                    Some(ConsoleInput::Eof) | None => {
                        info!("Console input closed");
                        break;
                    }
                },
            }
        }

        debug!("Console producer stopped");
    }

    fn accept(&self, line: &str) {
        let text = line.trim();
        if text.is_empty() {
            return;
        }

        let message = self.slot.set(text);
        debug!(id = %message.id, "Queued console message");
        self.console.queued(text);
    }
}
