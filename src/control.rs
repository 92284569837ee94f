//! Unix socket transport for the control surface.
//!
//! Each connection carries one request line and one response line, both
//! JSON. Every connection is served on its own thread, so a start or stop
//! waiting on the supervision loop doesn't hold up status queries.

use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    service::{Control, StatusEntry},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOp {
    Status,
    Start,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub op: RequestOp,
    /// Program name; empty or `all` addresses every program.
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub programs: Vec<StatusEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn success(programs: Vec<StatusEntry>) -> Self {
        Self {
            ok: true,
            programs,
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            programs: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Runs one request against the control surface.
pub fn handle(control: &Control, request: &Request) -> Response {
    debug!("Control request {:?}", request);
    let result = match request.op {
        RequestOp::Status => Ok(control.program_status(&request.name)),
        RequestOp::Start => control.start_program(&request.name),
        RequestOp::Stop => control.stop_program(&request.name),
    };

    match result {
        Ok(programs) => Response::success(programs),
        Err(err) => Response::failure(err.to_string()),
    }
}

/// Listening end, owned by the supervisor.
#[derive(Debug)]
pub struct Server {
    path: PathBuf,
    closing: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds `path`, replacing a leftover socket file, and starts accepting.
    pub fn bind(path: &Path, control: Control) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => warn!("Removed stale control socket {:?}", path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let listener = UnixListener::bind(path)?;
        info!("Listening for control requests on {:?}", path);

        let closing = Arc::new(AtomicBool::new(false));
        let accept = {
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name("pman-control".into())
                .spawn(move || accept_loop(&listener, &control, &closing))?
        };

        Ok(Self {
            path: path.to_owned(),
            closing,
            accept: Some(accept),
        })
    }

    /// Stops accepting and removes the socket file. Connections already
    /// being served run to completion on their own threads.
    pub fn close(mut self) {
        self.closing.store(true, Ordering::SeqCst);

        // accept() only returns on a connection, so make one
        match UnixStream::connect(&self.path) {
            Ok(_) => {
                if let Some(handle) = self.accept.take() {
                    if handle.join().is_err() {
                        error!("Control listener thread panicked");
                    }
                }
            }
            Err(err) => warn!("Couldn't wake control listener: {}", err),
        }

        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed control socket {:?}", self.path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => error!("Couldn't remove control socket {:?}: {}", self.path, err),
        }
    }
}

fn accept_loop(listener: &UnixListener, control: &Control, closing: &AtomicBool) {
    for stream in listener.incoming() {
        if closing.load(Ordering::SeqCst) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Couldn't accept control connection: {}", err);
                continue;
            }
        };

        let control = control.clone();
        let spawned = thread::Builder::new()
            .name("pman-conn".into())
            .spawn(move || {
                if let Err(err) = serve(&stream, &control) {
                    warn!("Control connection failed: {}", err);
                }
            });
        if let Err(err) = spawned {
            error!("Couldn't spawn control connection thread: {}", err);
        }
    }
    debug!("Control listener stopped");
}

fn serve(stream: &UnixStream, control: &Control) -> Result<()> {
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;

    let response = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(request) => handle(control, &request),
        Err(err) => Response::failure(format!("malformed request: {}", err)),
    };

    write_line(stream, &response)
}

fn write_line<T: Serialize>(mut stream: &UnixStream, value: &T) -> Result<()> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    stream.write_all(&buf)?;
    Ok(())
}

/// Calling end, used by the command-line client.
#[derive(Clone, Debug)]
pub struct Client {
    path: PathBuf,
}

impl Client {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sends one request and returns the status list from the reply.
    pub fn request(&self, op: RequestOp, name: &str) -> Result<Vec<StatusEntry>> {
        let stream = UnixStream::connect(&self.path)?;
        let request = Request {
            op,
            name: name.to_string(),
        };
        write_line(&stream, &request)?;

        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply)?;
        if reply.is_empty() {
            return Err(Error::Remote("supervisor closed the connection".into()));
        }

        let response: Response = serde_json::from_str(reply.trim_end())?;
        if response.ok {
            Ok(response.programs)
        } else {
            Err(Error::Remote(response.error.unwrap_or_default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConfigBuilder, ProgramConfigBuilder},
        program::Status,
        signal::SignalFlags,
        supervisor::Supervisor,
    };

    fn control() -> Control {
        let config = ConfigBuilder::default()
            .pidfile("/nonexistent/pman.pid")
            .logfile("/nonexistent/pman.log")
            .daemonize(false)
            .program(
                ProgramConfigBuilder::default()
                    .name("web")
                    .command(vec!["/bin/true".to_string()])
                    .logfile("/dev/null")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let flags = Box::leak(Box::new(SignalFlags::new()));
        Supervisor::with_flags(config, flags).control()
    }

    #[test]
    fn request_wire_shape() {
        let request: Request = serde_json::from_str(r#"{"op":"stop","name":"web"}"#).unwrap();
        assert_eq!(request.op, RequestOp::Stop);
        assert_eq!(request.name, "web");

        let bare: Request = serde_json::from_str(r#"{"op":"status"}"#).unwrap();
        assert_eq!(bare.name, "");
    }

    #[test]
    fn failure_carries_the_error() {
        let json = serde_json::to_string(&Response::failure("nope")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"nope"}"#);
    }

    #[test]
    fn status_is_answered_without_the_loop() {
        let response = handle(
            &control(),
            &Request {
                op: RequestOp::Status,
                name: String::new(),
            },
        );
        assert!(response.ok);
        assert_eq!(response.programs.len(), 1);
        assert_eq!(response.programs[0].status, Status::Stopped);
    }

    #[test]
    fn serves_status_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pman.sock");
        fs::write(&path, "stale").unwrap();

        let server = Server::bind(&path, control()).unwrap();
        let programs = Client::new(&path).request(RequestOp::Status, "web").unwrap();
        assert_eq!(programs[0].name, "web");

        let unknown = Client::new(&path).request(RequestOp::Status, "ghost").unwrap();
        assert!(unknown.is_empty());

        server.close();
        assert!(!path.exists());
    }

    #[test]
    fn malformed_request_gets_an_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pman.sock");
        let server = Server::bind(&path, control()).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"{\"op\":\"reboot\"}\n").unwrap();
        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply).unwrap();

        let response: Response = serde_json::from_str(&reply).unwrap();
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("malformed"));
        server.close();
    }

    #[test]
    fn client_without_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Client::new(dir.path().join("missing.sock")).request(RequestOp::Status, "");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
