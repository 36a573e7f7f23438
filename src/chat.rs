use std::{
    io::{self, Write},
    net::SocketAddr,
};

use crate::{
    buffer::Payload,
    event::{Controller, Runtime, TaskContext, TaskId},
    net::listen_on,
};

pub const PORT: u16 = 3567;

const NICKNAME_BUDGET: usize = 20;
const LINE_BUDGET: usize = 1000;

pub fn listen(addr: SocketAddr) -> anyhow::Result<Controller> {
    let listener = listen_on(addr)?;
    Ok(Controller::new(listener, |ctx| Box::pin(client_session(ctx))))
}

// one connected client: prompt for a nickname, then relay every line it
// sends to everyone else
async fn client_session(ctx: TaskContext) -> anyhow::Result<()> {
    ctx.send(b"Nickname: ").await?;
    let Some(nickname) = read_line(&ctx, NICKNAME_BUDGET - 1).await? else {
        return Ok(());
    };
    let mut prefix = Vec::with_capacity(nickname.len() + 3);
    prefix.push(b'<');
    prefix.extend_from_slice(&nickname);
    prefix.extend_from_slice(b"> ");
    loop {
        let Some(line) = read_line(&ctx, LINE_BUDGET - prefix.len() - 2).await? else {
            return Ok(());
        };
        let mut message = prefix.clone();
        message.extend_from_slice(&line);
        message.extend_from_slice(b"\r\n");
        broadcast(ctx.runtime(), &message, Some(ctx.id()))?
    }
}

// print the message on the server's stdout and fan a single shared payload
// out to every other client's write queue
pub fn broadcast(rt: &Runtime, message: &[u8], skip: Option<TaskId>) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(message)?;
    stdout.flush()?;
    rt.fan_out(&Payload::new(message), skip);
    Ok(())
}

// byte-at-a-time line reader: backspace rewinds one position, a stray
// leading LF (the trailing half of a CRLF split across reads) is dropped,
// CR ends the line. None means the peer closed the connection
async fn read_line(ctx: &TaskContext, budget: usize) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::with_capacity(budget);
    let mut byte = [0; 1];
    while line.len() < budget {
        if ctx.recv_exact(&mut byte).await? == 0 {
            return Ok(None);
        }
        if let LineStep::Done = push_byte(&mut line, byte[0]) {
            break;
        }
    }
    Ok(Some(line))
}

enum LineStep {
    More,
    Done,
}

fn push_byte(line: &mut Vec<u8>, byte: u8) -> LineStep {
    match byte {
        b'\n' if line.is_empty() => LineStep::More,
        0x08 => {
            line.pop();
            LineStep::More
        }
        b'\r' => LineStep::Done,
        _ => {
            line.push(byte);
            LineStep::More
        }
    }
}
