use std::{
    cell::RefCell,
    collections::HashMap,
    future::Future,
    io::{self, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use rustix::event::{poll, PollFd, PollFlags};
use tracing::{info, warn};

use crate::buffer::{Payload, WriteQueue};

// cooperative scheduler over a poll(2) readiness loop. every client task is
// straight-line async code; the controller polls a task exactly when its
// socket can make progress, so wakers are inert and the whole crate runs on
// one thread with no executor underneath

pub type TaskId = u32;

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

#[derive(Debug)]
struct TaskState {
    id: TaskId,
    socket: Rc<TcpStream>,
    queue: WriteQueue,
    last_write_error: Option<io::Error>,
    in_blocking_send: bool,
    started: bool,
    finished: bool,
    exit: Option<anyhow::Result<()>>,
}

#[derive(Debug, Default)]
struct Core {
    // insertion order is what broadcast and the sweeps observe; removal is
    // swap-with-last, which the reverse sweeps tolerate
    tasks: Vec<TaskState>,
    current: Option<TaskId>,
    next_id: TaskId,
}

#[derive(Debug, Clone, Default)]
pub struct Runtime(Rc<RefCell<Core>>);

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, socket: Rc<TcpStream>) -> TaskId {
        let mut core = self.0.borrow_mut();
        core.next_id += 1;
        let id = core.next_id;
        core.tasks.push(TaskState {
            id,
            socket,
            queue: WriteQueue::default(),
            last_write_error: None,
            in_blocking_send: false,
            started: false,
            finished: false,
            exit: None,
        });
        id
    }

    pub fn task_count(&self) -> usize {
        self.0.borrow().tasks.len()
    }

    fn with_task<R>(&self, id: TaskId, f: impl FnOnce(&mut TaskState) -> R) -> Option<R> {
        let mut core = self.0.borrow_mut();
        core.tasks.iter_mut().find(|task| task.id == id).map(f)
    }

    fn current(&self) -> Option<TaskId> {
        self.0.borrow().current
    }

    fn set_current(&self, value: Option<TaskId>) -> Option<TaskId> {
        std::mem::replace(&mut self.0.borrow_mut().current, value)
    }

    pub(crate) fn enqueue(&self, socket: &TcpStream, payload: Payload) -> io::Result<()> {
        let mut core = self.0.borrow_mut();
        let fd = socket.as_raw_fd();
        let Some(task) = core.tasks.iter_mut().find(|task| task.socket.as_raw_fd() == fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no task owns this socket",
            ));
        };
        task.queue.push(payload);
        Ok(())
    }

    // fan one shared payload out to every task except `skip`; each queue
    // entry references the same block, nothing is copied
    pub fn fan_out(&self, payload: &Payload, skip: Option<TaskId>) {
        let mut core = self.0.borrow_mut();
        for task in &mut core.tasks {
            if Some(task.id) == skip {
                continue;
            }
            task.queue.push(payload.clone())
        }
    }

    pub(crate) fn has_pending_writes(&self, id: TaskId) -> bool {
        self.with_task(id, |task| !task.queue.is_empty())
            .unwrap_or(false)
    }

    pub(crate) fn set_blocking_send(&self, id: TaskId, value: bool) {
        self.with_task(id, |task| task.in_blocking_send = value);
    }

    pub(crate) fn take_write_error(&self, id: TaskId) -> Option<io::Error> {
        self.with_task(id, |task| task.last_write_error.take())
            .flatten()
    }

    // collect a finished task: yield its exit result, free its write queue
    // and drop it from the task set; the last socket reference going away
    // closes the connection
    pub fn join(&self, id: TaskId) -> anyhow::Result<anyhow::Result<()>> {
        let mut core = self.0.borrow_mut();
        let Some(index) = core.tasks.iter().position(|task| task.id == id) else {
            anyhow::bail!("task {id} not found")
        };
        if !core.tasks[index].finished {
            anyhow::bail!("task {id} has not finished")
        }
        let mut task = core.tasks.swap_remove(index);
        task.queue.clear();
        Ok(task.exit.take().unwrap_or(Ok(())))
    }
}

// yield to the controller once; the task resumes when the controller next
// dispatches it
pub(crate) struct Park(bool);

pub(crate) fn park() -> Park {
    Park(false)
}

impl Future for Park {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            Poll::Pending
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) rt: Runtime,
    pub(crate) id: TaskId,
    pub(crate) socket: Rc<TcpStream>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }
}

pub struct Controller {
    rt: Runtime,
    listener: TcpListener,
    handler: Box<dyn FnMut(TaskContext) -> TaskFuture>,
    futures: HashMap<TaskId, TaskFuture>,
}

impl Controller {
    pub fn new(
        listener: TcpListener,
        handler: impl FnMut(TaskContext) -> TaskFuture + 'static,
    ) -> Self {
        Self {
            rt: Runtime::new(),
            listener,
            handler: Box::new(handler),
            futures: Default::default(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        loop {
            self.turn(-1)?
        }
    }

    fn turn(&mut self, timeout: i32) -> anyhow::Result<()> {
        struct Interest {
            id: TaskId,
            socket: Rc<TcpStream>,
            read: bool,
            write: bool,
        }
        // the readiness sets are rebuilt from scratch on every turn
        let interests = {
            let core = self.rt.0.borrow();
            core.tasks
                .iter()
                .filter_map(|task| {
                    let read = !task.in_blocking_send;
                    let write = !task.queue.is_empty() && task.last_write_error.is_none();
                    (read || write).then(|| Interest {
                        id: task.id,
                        socket: task.socket.clone(),
                        read,
                        write,
                    })
                })
                .collect::<Vec<_>>()
        };
        let mut fds = Vec::with_capacity(interests.len() + 1);
        fds.push(PollFd::new(&self.listener, PollFlags::IN));
        for interest in &interests {
            let mut flags = PollFlags::empty();
            if interest.read {
                flags |= PollFlags::IN
            }
            if interest.write {
                flags |= PollFlags::OUT
            }
            fds.push(PollFd::new(&*interest.socket, flags))
        }
        let ready = match poll(&mut fds, timeout) {
            Ok(n) => n,
            Err(err) if err == rustix::io::Errno::INTR => 0,
            Err(err) => return Err(io::Error::from(err).into()),
        };
        if ready == 0 {
            return Ok(());
        }
        let accept_ready = fds[0]
            .revents()
            .intersects(PollFlags::IN | PollFlags::ERR | PollFlags::HUP);
        let events = interests
            .iter()
            .zip(&fds[1..])
            .filter_map(|(interest, fd)| {
                let revents = fd.revents();
                let read = interest.read
                    && revents.intersects(PollFlags::IN | PollFlags::ERR | PollFlags::HUP);
                let write = interest.write
                    && revents.intersects(PollFlags::OUT | PollFlags::ERR | PollFlags::HUP);
                (read || write).then_some((interest.id, read, write))
            })
            .collect::<Vec<_>>();
        drop(fds);

        if accept_ready {
            self.accept_one()
        }
        // reverse insertion order, so removals along the way cannot make the
        // sweep skip anyone
        for (id, read, write) in events.into_iter().rev() {
            if read {
                self.dispatch(id)
            }
            if write {
                self.pump(id)
            }
        }
        self.sweep();
        Ok(())
    }

    fn accept_one(&mut self) {
        match self.listener.accept() {
            Ok((socket, peer)) => {
                info!("accept {peer}");
                if let Err(err) = self.spawn(socket) {
                    warn!("spawn for {peer}: {err:#}")
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            // the listener survives; this connection is simply not served
            Err(err) => warn!("accept: {err}"),
        }
    }

    // create a task for `socket`, register it and run it up to its first
    // suspension point
    pub fn spawn(&mut self, socket: TcpStream) -> anyhow::Result<TaskId> {
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        let socket = Rc::new(socket);
        let id = self.rt.register(socket.clone());
        let ctx = TaskContext {
            rt: self.rt.clone(),
            id,
            socket,
        };
        let future = (self.handler)(ctx);
        self.futures.insert(id, future);
        self.dispatch(id);
        Ok(id)
    }

    // resume `id` until it yields back; no-op when the task is already
    // current or has no context left to resume
    fn dispatch(&mut self, id: TaskId) {
        if self.rt.current() == Some(id) {
            return;
        }
        let Some(mut future) = self.futures.remove(&id) else {
            return;
        };
        let previous = self.rt.set_current(Some(id));
        self.rt.with_task(id, |task| task.started = true);
        let poll = future
            .as_mut()
            .poll(&mut Context::from_waker(Waker::noop()));
        self.rt.set_current(previous);
        match poll {
            Poll::Pending => {
                self.futures.insert(id, future);
            }
            Poll::Ready(exit) => {
                self.rt.with_task(id, |task| {
                    task.finished = true;
                    task.exit = Some(exit)
                });
            }
        }
    }

    fn pump(&mut self, id: TaskId) {
        let Some((socket, payload, offset)) = self
            .rt
            .with_task(id, |task| {
                task.queue
                    .head()
                    .map(|(payload, offset)| (task.socket.clone(), payload, offset))
            })
            .flatten()
        else {
            return;
        };
        // only one send is performed per multiplexer call; more could block,
        // since the kernel buffer state is only known fresh right after
        // readiness signalling
        match (&*socket).write(&payload.as_ref()[offset..]) {
            Ok(n) => {
                self.rt.with_task(id, |task| task.queue.advance(n));
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                self.rt
                    .with_task(id, |task| task.last_write_error = Some(err));
            }
        }
    }

    fn sweep(&mut self) {
        let ids = {
            let core = self.rt.0.borrow();
            core.tasks
                .iter()
                .map(|task| task.id)
                .rev()
                .collect::<Vec<_>>()
        };
        for id in ids {
            let Some((unblock, finished)) = self.rt.with_task(id, |task| {
                let unblock = task.in_blocking_send
                    && (task.queue.is_empty() || task.last_write_error.is_some());
                (unblock, task.finished)
            }) else {
                continue;
            };
            if unblock && !finished {
                self.dispatch(id)
            }
            if self.rt.with_task(id, |task| task.finished) == Some(true) {
                self.reap(id)
            }
        }
    }

    fn reap(&mut self, id: TaskId) {
        self.futures.remove(&id);
        match self.rt.join(id) {
            Ok(Ok(())) => info!("task {id} closed"),
            Ok(Err(err)) => warn!("task {id}: {err:#}"),
            Err(err) => warn!("reap {id}: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use crate::net::listen_on;

    use super::*;

    fn relay(
        handler: impl FnMut(TaskContext) -> TaskFuture + 'static,
    ) -> (Controller, SocketAddr) {
        let listener = listen_on(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = listener.local_addr().unwrap();
        (Controller::new(listener, handler), addr)
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        (local, peer)
    }

    #[test]
    fn spawn_runs_to_first_suspension() {
        let (mut server, addr) = relay(|ctx| {
            Box::pin(async move {
                ctx.send(b"hello").await?;
                Ok(())
            })
        });
        let mut peer = TcpStream::connect(addr).unwrap();
        server.turn(1000).unwrap();
        {
            let core = server.rt.0.borrow();
            assert_eq!(core.tasks.len(), 1);
            let task = &core.tasks[0];
            assert!(task.started);
            assert!(!task.finished);
            assert!(task.in_blocking_send);
            assert_eq!(task.queue.len(), 1);
        }
        for _ in 0..10 {
            if server.rt.task_count() == 0 {
                break;
            }
            server.turn(1000).unwrap()
        }
        assert_eq!(server.rt.task_count(), 0);
        let mut buf = [0; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello")
    }

    #[test]
    fn recv_parks_until_readable() {
        let (mut server, addr) = relay(|ctx| {
            Box::pin(async move {
                let mut buf = [0; 4];
                if ctx.recv_exact(&mut buf).await? == 4 {
                    ctx.send(&buf).await?;
                }
                Ok(())
            })
        });
        let mut peer = TcpStream::connect(addr).unwrap();
        server.turn(1000).unwrap();
        assert_eq!(server.rt.task_count(), 1);
        assert_eq!(
            server.rt.with_task(1, |task| task.in_blocking_send),
            Some(false)
        );
        peer.write_all(b"ping").unwrap();
        for _ in 0..10 {
            if server.rt.task_count() == 0 {
                break;
            }
            server.turn(1000).unwrap()
        }
        assert_eq!(server.rt.task_count(), 0);
        let mut buf = [0; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping")
    }

    #[test]
    fn fan_out_shares_one_block() {
        let rt = Runtime::new();
        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (local, remote) = pair();
            ids.push(rt.register(Rc::new(local)));
            peers.push(remote)
        }
        let payload = Payload::new(b"<a> hi\r\n");
        rt.fan_out(&payload, Some(ids[0]));
        assert_eq!(payload.handles(), 3);
        assert_eq!(rt.with_task(ids[0], |task| task.queue.len()), Some(0));
        rt.with_task(ids[1], |task| task.queue.advance(payload.len()));
        assert_eq!(payload.handles(), 2);
        rt.with_task(ids[2], |task| task.queue.advance(payload.len()));
        assert_eq!(payload.handles(), 1)
    }

    #[test]
    fn empty_send_waits_for_drain() {
        let (mut server, addr) = relay(|ctx| {
            Box::pin(async move {
                let payload = Payload::new(b"seeded");
                ctx.runtime().fan_out(&payload, None);
                let n = ctx.send(b"").await?;
                anyhow::ensure!(n == 0, "empty send reported {n} bytes");
                Ok(())
            })
        });
        let mut peer = TcpStream::connect(addr).unwrap();
        server.turn(1000).unwrap();
        {
            let core = server.rt.0.borrow();
            let task = &core.tasks[0];
            assert!(task.in_blocking_send);
            assert_eq!(task.queue.len(), 1);
        }
        for _ in 0..10 {
            if server.rt.task_count() == 0 {
                break;
            }
            server.turn(1000).unwrap()
        }
        assert_eq!(server.rt.task_count(), 0);
        let mut buf = [0; 6];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"seeded")
    }

    #[test]
    fn write_error_unparks_sender() {
        let (mut server, addr) = relay(|ctx| {
            Box::pin(async move {
                loop {
                    if ctx.send(b"spam spam spam spam").await.is_err() {
                        return Ok(());
                    }
                }
            })
        });
        let peer = TcpStream::connect(addr).unwrap();
        server.turn(1000).unwrap();
        assert_eq!(server.rt.task_count(), 1);
        drop(peer);
        for _ in 0..50 {
            if server.rt.task_count() == 0 {
                break;
            }
            server.turn(1000).unwrap()
        }
        assert_eq!(server.rt.task_count(), 0)
    }

    #[test]
    fn join_requires_finished() {
        let rt = Runtime::new();
        let (local, _peer) = pair();
        let id = rt.register(Rc::new(local));
        assert!(rt.join(id).is_err());
        assert!(rt.join(id + 1).is_err());
        assert_eq!(rt.task_count(), 1)
    }
}
