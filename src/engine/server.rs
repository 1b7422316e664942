//! Engine side of the protocol.
//!
//! An engine binary implements [`EngineHandler`] and hands it to [`serve`],
//! which prints the hello line, answers `dispense`, and runs each incoming
//! call on its own thread so calls may overlap.
use super::protocol::{
    EngineMessage, Frame, Hello, HostMessage, InitRequest, RunRequest, ShutdownRequest,
    MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, SERVICE_NAME,
};
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::thread;

/// Serves the three engine calls. Returning `Err` ends the call with an
/// `error` message instead of `end`.
pub trait EngineHandler: Sync {
    fn init(&self, request: &InitRequest, out: &FrameSink<'_>) -> Result<(), String>;
    fn run(&self, request: &RunRequest, out: &FrameSink<'_>) -> Result<(), String>;
    fn shutdown(&self, request: &ShutdownRequest, out: &FrameSink<'_>) -> Result<(), String>;
}

/// Serializes whole messages onto the shared output.
pub struct MessageWriter<W: Write> {
    inner: Mutex<W>,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.inner.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn send(&self, message: &EngineMessage) -> io::Result<()> {
        let line = serde_json::to_string(message)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.write_line(&line)
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

/// Frame output for one call.
pub struct FrameSink<'a> {
    id: u64,
    writer: &'a (dyn FrameWrite + Sync),
}

/// Object-safe view of a [`MessageWriter`].
pub trait FrameWrite {
    fn send_message(&self, message: &EngineMessage) -> io::Result<()>;
}

impl<W: Write> FrameWrite for MessageWriter<W> {
    fn send_message(&self, message: &EngineMessage) -> io::Result<()> {
        self.send(message)
    }
}

impl FrameSink<'_> {
    pub fn frame(&self, frame: Frame) -> io::Result<()> {
        self.writer
            .send_message(&EngineMessage::Frame { id: self.id, frame })
    }

    pub fn stdout(&self, text: impl Into<String>) -> io::Result<()> {
        self.frame(Frame::stdout(text))
    }

    pub fn stderr(&self, text: impl Into<String>) -> io::Result<()> {
        self.frame(Frame::stderr(text))
    }

    pub fn result_code(&self, code: i32) -> io::Result<()> {
        self.frame(Frame::result(code))
    }
}

/// Error text for a binary started without the host's cookie.
pub fn check_magic_cookie() -> Result<(), String> {
    match std::env::var(MAGIC_COOKIE_KEY) {
        Ok(value) if value == MAGIC_COOKIE_VALUE => Ok(()),
        _ => Err(format!(
            "this binary is an iacrun engine and is not meant to be executed directly; \
             run it through `iacrun run` with an engine configured ({MAGIC_COOKIE_KEY} is not set)"
        )),
    }
}

/// Serve calls read from `input` until it reaches end of file.
///
/// Returns once every in-flight call has finished.
pub fn serve<H, R, W>(handler: &H, input: R, output: W) -> io::Result<W>
where
    H: EngineHandler,
    R: BufRead,
    W: Write + Send,
{
    let writer = MessageWriter::new(output);
    writer.write_line(&Hello::current().render())?;
    let result = thread::scope(|scope| -> io::Result<()> {
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<HostMessage>(&line) {
                Ok(message) => message,
                Err(err) => {
                    writer.send(&EngineMessage::Error {
                        id: None,
                        message: format!("unreadable request: {err}"),
                    })?;
                    continue;
                }
            };
            match message {
                HostMessage::Dispense { service } if service == SERVICE_NAME => {
                    writer.send(&EngineMessage::Dispensed { service })?;
                }
                HostMessage::Dispense { service } => {
                    writer.send(&EngineMessage::Error {
                        id: None,
                        message: format!("unknown service {service:?}"),
                    })?;
                }
                call => {
                    let writer = &writer;
                    scope.spawn(move || dispatch(handler, writer, call));
                }
            }
        }
        Ok(())
    });
    result?;
    Ok(writer.into_inner())
}

fn dispatch<H: EngineHandler, W: Write + Send>(
    handler: &H,
    writer: &MessageWriter<W>,
    call: HostMessage,
) {
    let (id, outcome) = match &call {
        HostMessage::Init { id, request } => (*id, handler.init(request, &sink(*id, writer))),
        HostMessage::Run { id, request } => (*id, handler.run(request, &sink(*id, writer))),
        HostMessage::Shutdown { id, request } => {
            (*id, handler.shutdown(request, &sink(*id, writer)))
        }
        HostMessage::Dispense { .. } => return,
    };
    let reply = match outcome {
        Ok(()) => EngineMessage::End { id },
        Err(message) => EngineMessage::Error {
            id: Some(id),
            message,
        },
    };
    if let Err(err) = writer.send(&reply) {
        tracing::warn!(id, error = %err, "failed to send reply");
    }
}

fn sink<W: Write + Send>(id: u64, writer: &MessageWriter<W>) -> FrameSink<'_> {
    FrameSink { id, writer }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Echo;

    impl EngineHandler for Echo {
        fn init(&self, request: &InitRequest, out: &FrameSink<'_>) -> Result<(), String> {
            out.stdout(format!("init {}\n", request.working_dir))
                .map_err(|err| err.to_string())
        }

        fn run(&self, request: &RunRequest, out: &FrameSink<'_>) -> Result<(), String> {
            if request.command == "fail" {
                return Err("refused".to_string());
            }
            out.stdout(format!("{} {}\n", request.command, request.args.join(" ")))
                .and_then(|()| out.result_code(0))
                .map_err(|err| err.to_string())
        }

        fn shutdown(&self, _request: &ShutdownRequest, _out: &FrameSink<'_>) -> Result<(), String> {
            Ok(())
        }
    }

    fn messages(output: &[u8]) -> (String, Vec<EngineMessage>) {
        let text = String::from_utf8(output.to_vec()).expect("utf8");
        let mut lines = text.lines();
        let hello = lines.next().expect("hello").to_string();
        let messages = lines
            .map(|line| serde_json::from_str(line).expect("engine message"))
            .collect();
        (hello, messages)
    }

    fn request(message: &HostMessage) -> String {
        serde_json::to_string(message).expect("serialize")
    }

    #[test]
    fn serves_handshake_and_calls() {
        let input = [
            request(&HostMessage::Dispense {
                service: "engine".to_string(),
            }),
            request(&HostMessage::Run {
                id: 7,
                request: RunRequest {
                    working_dir: "/w".to_string(),
                    command: "tofu".to_string(),
                    args: vec!["plan".to_string()],
                    ..RunRequest::default()
                },
            }),
        ]
        .join("\n");
        let output = serve(&Echo, Cursor::new(input), Vec::new()).expect("serve");
        let (hello, messages) = messages(&output);
        assert_eq!(hello, "1|1|stdio|jsonl");
        assert_eq!(
            messages,
            vec![
                EngineMessage::Dispensed {
                    service: "engine".to_string()
                },
                EngineMessage::Frame {
                    id: 7,
                    frame: Frame::stdout("tofu plan\n")
                },
                EngineMessage::Frame {
                    id: 7,
                    frame: Frame::result(0)
                },
                EngineMessage::End { id: 7 },
            ]
        );
    }

    #[test]
    fn handler_error_and_unknown_service_are_reported() {
        let input = [
            request(&HostMessage::Dispense {
                service: "provider".to_string(),
            }),
            request(&HostMessage::Run {
                id: 1,
                request: RunRequest {
                    command: "fail".to_string(),
                    ..RunRequest::default()
                },
            }),
            "{not json".to_string(),
        ]
        .join("\n");
        let output = serve(&Echo, Cursor::new(input), Vec::new()).expect("serve");
        let (_, messages) = messages(&output);
        assert!(messages.iter().any(|m| matches!(
            m,
            EngineMessage::Error { id: None, message } if message.contains("provider")
        )));
        assert!(messages.contains(&EngineMessage::Error {
            id: Some(1),
            message: "refused".to_string()
        }));
        assert!(messages.iter().any(|m| matches!(
            m,
            EngineMessage::Error { id: None, message } if message.contains("unreadable")
        )));
    }
}
