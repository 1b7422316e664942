//! Wire protocol shared by the host and engine binaries.
//!
//! Transport is the engine's stdin/stdout, one JSON document per line.
//! Session setup is a two-step handshake:
//!
//! ```text
//! engine -> host   1|1|stdio|jsonl            (hello line)
//! host   -> engine {"type":"dispense","service":"engine"}
//! engine -> host   {"type":"dispensed","service":"engine"}
//! ```
//!
//! After that the host issues calls tagged with an id and the engine answers
//! with any number of `frame` messages followed by one `end` (or `error`) for
//! that id. Calls may be in flight concurrently.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the handshake framing itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;
/// Version of the Init/Run/Shutdown service.
pub const APP_PROTOCOL_VERSION: u32 = 1;
pub const TRANSPORT: &str = "stdio";
pub const PROTOCOL: &str = "jsonl";
/// The single service an engine exposes.
pub const SERVICE_NAME: &str = "engine";

/// Environment key carrying the magic cookie into the engine process.
pub const MAGIC_COOKIE_KEY: &str = "IACRUN_ENGINE_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "7f3c9e21b4d84a5f9a0e6c1d2b3a4f5e";
/// Environment key carrying the engine log level.
pub const LOG_LEVEL_ENV: &str = "IACRUN_ENGINE_LOG_LEVEL";

/// One unit of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i32>,
}

impl Frame {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            ..Self::default()
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stderr: text.into(),
            ..Self::default()
        }
    }

    pub fn result(code: i32) -> Self {
        Self {
            result_code: Some(code),
            ..Self::default()
        }
    }
}

pub type Meta = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    pub working_dir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub working_dir: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub allocate_pseudo_tty: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub working_dir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: Meta,
}

/// Messages written by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Dispense { service: String },
    Init { id: u64, request: InitRequest },
    Run { id: u64, request: RunRequest },
    Shutdown { id: u64, request: ShutdownRequest },
}

/// Messages written by the engine after the hello line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    Dispensed {
        service: String,
    },
    Frame {
        id: u64,
        #[serde(flatten)]
        frame: Frame,
    },
    End {
        id: u64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: String,
    },
}

/// The engine's first stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub core_version: u32,
    pub app_version: u32,
    pub transport: String,
    pub protocol: String,
}

impl Hello {
    /// The hello this build speaks.
    pub fn current() -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: APP_PROTOCOL_VERSION,
            transport: TRANSPORT.to_string(),
            protocol: PROTOCOL.to_string(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.core_version, self.app_version, self.transport, self.protocol
        )
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [core, app, transport, protocol] = parts.as_slice() else {
            return Err(format!("malformed hello line {:?}", line.trim()));
        };
        let core_version = core
            .parse()
            .map_err(|_| format!("invalid core protocol version {core:?}"))?;
        let app_version = app
            .parse()
            .map_err(|_| format!("invalid app protocol version {app:?}"))?;
        Ok(Self {
            core_version,
            app_version,
            transport: transport.to_string(),
            protocol: protocol.to_string(),
        })
    }
}

/// Host-side handshake progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHello,
    Negotiated(Hello),
    Dispensed(Hello),
}

/// Drives the host side of session setup; transitions only forward.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitingHello,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, HandshakeState::Dispensed(_))
    }

    /// Accept the engine's hello line and return the dispense request to send.
    pub fn on_hello(&mut self, line: &str) -> Result<HostMessage, String> {
        if self.state != HandshakeState::AwaitingHello {
            return Err("hello received twice".to_string());
        }
        let hello = Hello::parse(line)?;
        if hello.core_version != CORE_PROTOCOL_VERSION {
            return Err(format!(
                "engine speaks core protocol {}, expected {CORE_PROTOCOL_VERSION}",
                hello.core_version
            ));
        }
        if hello.app_version != APP_PROTOCOL_VERSION {
            return Err(format!(
                "engine speaks app protocol {}, expected {APP_PROTOCOL_VERSION}",
                hello.app_version
            ));
        }
        if hello.transport != TRANSPORT || hello.protocol != PROTOCOL {
            return Err(format!(
                "engine offers {}/{}, only {TRANSPORT}/{PROTOCOL} is allowed",
                hello.transport, hello.protocol
            ));
        }
        self.state = HandshakeState::Negotiated(hello);
        Ok(HostMessage::Dispense {
            service: SERVICE_NAME.to_string(),
        })
    }

    /// Accept the engine's answer to the dispense request.
    pub fn on_dispense_reply(&mut self, message: &EngineMessage) -> Result<(), String> {
        let HandshakeState::Negotiated(hello) = &self.state else {
            return Err("dispense reply before hello".to_string());
        };
        match message {
            EngineMessage::Dispensed { service } if service == SERVICE_NAME => {
                self.state = HandshakeState::Dispensed(hello.clone());
                Ok(())
            }
            EngineMessage::Dispensed { service } => {
                Err(format!("engine dispensed unknown service {service:?}"))
            }
            EngineMessage::Error { message, .. } => Err(format!("dispense failed: {message}")),
            other => Err(format!("unexpected message during dispense: {other:?}")),
        }
    }
}
