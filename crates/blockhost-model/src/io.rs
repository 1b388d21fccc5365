/// A line produced by the server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOutput {
    Log(String),
    Error(String),
}

/// Any line crossing the console: something typed in, or something printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerIo {
    Input(String),
    Output(ServerOutput),
}

impl ServerIo {
    pub fn text(&self) -> &str {
        match self {
            ServerIo::Input(t) => t,
            ServerIo::Output(ServerOutput::Log(t)) | ServerIo::Output(ServerOutput::Error(t)) => t,
        }
    }

    /// Line as stored in a past run's log.
    pub fn render(&self) -> String {
        match self {
            ServerIo::Input(t) => format!("> {t}"),
            ServerIo::Output(ServerOutput::Log(t)) => t.clone(),
            ServerIo::Output(ServerOutput::Error(t)) => format!("[stderr] {t}"),
        }
    }
}

impl From<ServerOutput> for ServerIo {
    fn from(value: ServerOutput) -> Self {
        ServerIo::Output(value)
    }
}

/// Element of a process stream. Every stream ends with exactly one `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessMessage<T> {
    Io(T),
    End { exit_code: Option<i32> },
}

impl<T> ProcessMessage<T> {
    pub fn is_end(&self) -> bool {
        matches!(self, ProcessMessage::End { .. })
    }
}

/// JSON frame used on console WebSockets (monitor `/io` and the frontend console).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ConsoleMessage {
    Input { text: String },
    Log { text: String },
    Error { text: String },
}

impl From<ServerIo> for ConsoleMessage {
    fn from(value: ServerIo) -> Self {
        match value {
            ServerIo::Input(text) => ConsoleMessage::Input { text },
            ServerIo::Output(ServerOutput::Log(text)) => ConsoleMessage::Log { text },
            ServerIo::Output(ServerOutput::Error(text)) => ConsoleMessage::Error { text },
        }
    }
}

impl From<ConsoleMessage> for ServerIo {
    fn from(value: ConsoleMessage) -> Self {
        match value {
            ConsoleMessage::Input { text } => ServerIo::Input(text),
            ConsoleMessage::Log { text } => ServerIo::Output(ServerOutput::Log(text)),
            ConsoleMessage::Error { text } => ServerIo::Output(ServerOutput::Error(text)),
        }
    }
}
