//! Connection dispatcher and worker pool.
//!
//! A single dispatcher thread owns every idle connection and multiplexes
//! readiness with poll(2). When a client announces a request with its
//! trigger token, the socket itself is handed to an idle worker over that
//! worker's assignment channel; the worker runs exactly one request and
//! sends the socket back on the shared completion channel. Ownership of the
//! stream moves with the messages, so a connection can never be dispatched
//! twice at once. With no idle worker the dispatcher answers Busy itself
//! and keeps the socket.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::logger::Logger;
use crate::protocol::{write_header, Header, Status, OP_NONE};
use crate::session::{self, RequestOutcome, SessionContext};

enum Assignment {
    Serve { conn_id: u32, stream: TcpStream },
}

struct Completion {
    worker: usize,
    conn_id: u32,
    /// Stream comes back for re-watching unless the request closed it.
    stream: Option<TcpStream>,
}

struct WorkerHandle {
    tx: Sender<Assignment>,
    idle: bool,
}

/// Self-pipe used by workers to interrupt the dispatcher's poll.
struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    fn new() -> Result<WakePipe> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error()).context("create wake pipe");
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0
                || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            {
                return Err(std::io::Error::last_os_error()).context("set wake pipe nonblocking");
            }
        }
        Ok(WakePipe { read_fd: fds[0], write_fd: fds[1] })
    }

    /// Discard all pending wake bytes.
    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Interrupt the dispatcher. Safe to call from any thread; a full pipe
/// means a wake is already pending, so the short write is ignored.
fn wake(write_fd: RawFd) {
    let byte = [1u8];
    unsafe {
        libc::write(write_fd, byte.as_ptr() as *const libc::c_void, 1);
    }
}

pub struct Server {
    ctx: Arc<SessionContext>,
    listener: TcpListener,
    workers: usize,
}

impl Server {
    pub fn bind(config: Config, logger: Arc<dyn Logger>) -> Result<Server> {
        let listener = TcpListener::bind(&config.bind)
            .with_context(|| format!("bind {}", config.bind))?;
        let workers = config.workers;
        let ctx = Arc::new(SessionContext::new(config, logger));
        Ok(Server { ctx, listener, workers })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    pub fn run(self) -> Result<()> {
        let wake_pipe = WakePipe::new()?;
        let wake_fd = wake_pipe.write_fd;
        let (done_tx, done_rx): (Sender<Completion>, Receiver<Completion>) = mpsc::channel();

        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let (tx, rx) = mpsc::channel::<Assignment>();
            let ctx = Arc::clone(&self.ctx);
            let done = done_tx.clone();
            thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || worker_loop(index, ctx, rx, done, wake_fd))
                .context("spawn worker thread")?;
            workers.push(WorkerHandle { tx, idle: true });
        }

        self.listener
            .set_nonblocking(true)
            .context("set listener nonblocking")?;
        eprintln!(
            "syncboxd listening on {} root={}",
            self.listener.local_addr().context("listener address")?,
            self.ctx.config.root.display()
        );

        let mut watched: HashMap<RawFd, (u32, TcpStream)> = HashMap::new();
        let mut next_conn_id: u32 = 1;

        loop {
            // Returned streams go back into the watch set before polling.
            while let Ok(done) = done_rx.try_recv() {
                workers[done.worker].idle = true;
                if let Some(stream) = done.stream {
                    watched.insert(stream.as_raw_fd(), (done.conn_id, stream));
                }
            }

            let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(2 + watched.len());
            pollfds.push(pollfd_for(wake_pipe.read_fd));
            pollfds.push(pollfd_for(self.listener.as_raw_fd()));
            for fd in watched.keys() {
                pollfds.push(pollfd_for(*fd));
            }

            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1)
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                bail!("poll failed: {}", err);
            }

            if ready(&pollfds[0]) {
                wake_pipe.drain();
            }
            if ready(&pollfds[1]) {
                self.accept_ready(&mut watched, &mut next_conn_id);
            }

            let ready_fds: Vec<RawFd> =
                pollfds[2..].iter().filter(|p| ready(p)).map(|p| p.fd).collect();
            for fd in ready_fds {
                let Some((conn_id, mut stream)) = watched.remove(&fd) else {
                    continue;
                };
                let mut token = [0u8; 4];
                if stream.read_exact(&mut token).is_err() {
                    self.drop_connection(conn_id);
                    continue;
                }
                match workers.iter().position(|w| w.idle) {
                    Some(index) => {
                        workers[index].idle = false;
                        if workers[index].tx.send(Assignment::Serve { conn_id, stream }).is_err()
                        {
                            bail!("worker {} is gone", index);
                        }
                    }
                    None => {
                        self.ctx.logger.busy(conn_id);
                        if write_header(
                            &mut stream,
                            &Header::response(OP_NONE, Status::Busy, conn_id),
                        )
                        .is_err()
                        {
                            self.drop_connection(conn_id);
                            continue;
                        }
                        watched.insert(fd, (conn_id, stream));
                    }
                }
            }
        }
    }

    fn accept_ready(&self, watched: &mut HashMap<RawFd, (u32, TcpStream)>, next_id: &mut u32) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn_id = *next_id;
                    *next_id = next_id.wrapping_add(1).max(1);
                    stream.set_nodelay(true).ok();
                    eprintln!("conn {}: accepted from {}", conn_id, peer);
                    watched.insert(stream.as_raw_fd(), (conn_id, stream));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // fd exhaustion and friends: log and back off to poll
                    eprintln!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn drop_connection(&self, conn_id: u32) {
        if let Some(record) = self.ctx.registry.remove(conn_id) {
            eprintln!("[{}] [conn = {}] logout", record.user, conn_id);
            self.ctx.logger.logout(&record.user, conn_id);
        } else {
            eprintln!("conn {}: closed", conn_id);
        }
    }
}

fn pollfd_for(fd: RawFd) -> libc::pollfd {
    libc::pollfd { fd, events: libc::POLLIN, revents: 0 }
}

fn ready(p: &libc::pollfd) -> bool {
    p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

fn worker_loop(
    index: usize,
    ctx: Arc<SessionContext>,
    rx: Receiver<Assignment>,
    done: Sender<Completion>,
    wake_fd: RawFd,
) {
    while let Ok(Assignment::Serve { conn_id, mut stream }) = rx.recv() {
        // Ack the trigger so the client starts sending its request.
        let back = match write_header(&mut stream, &Header::response(OP_NONE, Status::Ok, conn_id))
        {
            Err(_) => {
                drop_record(&ctx, conn_id);
                None
            }
            Ok(()) => match session::handle_request(&ctx, &mut stream, conn_id) {
                Ok(RequestOutcome::Continue) => Some(stream),
                Ok(RequestOutcome::Closed) => None,
                Err(e) => {
                    eprintln!("conn {}: request failed: {:#}", conn_id, e);
                    ctx.logger.error("request", &format!("conn {}: {:#}", conn_id, e));
                    drop_record(&ctx, conn_id);
                    None
                }
            },
        };
        if done.send(Completion { worker: index, conn_id, stream: back }).is_err() {
            return;
        }
        wake(wake_fd);
    }
}

fn drop_record(ctx: &SessionContext, conn_id: u32) {
    if let Some(record) = ctx.registry.remove(conn_id) {
        ctx.logger.logout(&record.user, conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_pipe_drains_pending_bytes() {
        let pipe = WakePipe::new().unwrap();
        wake(pipe.write_fd);
        wake(pipe.write_fd);
        let mut pfd = pollfd_for(pipe.read_fd);
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        assert_eq!(rc, 1);
        assert!(ready(&pfd));
        pipe.drain();
        let mut pfd = pollfd_for(pipe.read_fd);
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(rc, 0);
    }
}
