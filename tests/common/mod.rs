//! Simulated SCPI instrument served over loopback TCP.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use scpi_session::{
    Session, SessionConfig,
    block::{BinFloatFormat, encode_block},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    time::Instant,
};

pub const IDN: &str = "Rohde&Schwarz,SIM1000,100001/001,1.0.0";

/// Exactly representable as f32, so every wire format decodes identically
pub const TRACE: [f64; 6] = [-1.5, 0.25, 3.0, 1024.5, -0.125, 0.0];

#[derive(Default)]
pub struct SimState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    op_duration: Mutex<Duration>,
    condition_queries: AtomicUsize,
    self_test_result: Mutex<Option<String>>,
    local: AtomicBool,
}

pub struct SimInstrument {
    pub addr: SocketAddr,
    state: Arc<SimState>,
}
impl SimInstrument {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(SimState::default());

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn uri(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub async fn session(&self, config: SessionConfig) -> Session {
        Session::open(&self.uri(), config).await.unwrap()
    }

    /// How long `SING` and `*TST?` keep the instrument busy
    pub fn set_op_duration(&self, duration: Duration) {
        *self.state.op_duration.lock().unwrap() = duration;
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.files.lock().unwrap().get(path).cloned()
    }

    pub fn put_file(&self, path: &str, data: Vec<u8>) {
        self.state.files.lock().unwrap().insert(path.to_string(), data);
    }

    /// `*TST?` reply, `0` unless set
    pub fn set_self_test_result(&self, result: &str) {
        *self.state.self_test_result.lock().unwrap() = Some(result.to_string());
    }

    /// Front panel released with `&GTL`
    pub fn is_local(&self) -> bool {
        self.state.local.load(Ordering::SeqCst)
    }

    pub fn condition_queries(&self) -> usize {
        self.state.condition_queries.load(Ordering::SeqCst)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

enum Message {
    Text(String),
    WithBlock { header: String, data: Vec<u8> },
}

#[derive(Clone, Copy)]
enum DataFormat {
    Ascii,
    Real32,
    Real64,
}

struct Connection {
    state: Arc<SimState>,
    errors: VecDeque<(i32, String)>,
    busy_until: Instant,
    opc_armed: bool,
    format: DataFormat,
    swapped: bool,
    frequency: f64,
}
impl Connection {
    fn push_error(&mut self, code: i32, message: String) {
        self.errors.push_back((code, message));
    }

    fn bin_format(&self) -> BinFloatFormat {
        match (self.format, self.swapped) {
            (DataFormat::Real64, true) => BinFloatFormat::Double8Le,
            (DataFormat::Real64, false) => BinFloatFormat::Double8Be,
            (_, true) => BinFloatFormat::Single4Le,
            (_, false) => BinFloatFormat::Single4Be,
        }
    }

    fn start_operation(&mut self) {
        let duration = *self.state.op_duration.lock().unwrap();
        self.busy_until = Instant::now() + duration;
    }

    async fn handle_text(&mut self, text: &str) -> Option<Vec<u8>> {
        let mut parts: Vec<Vec<u8>> = vec![];

        for unit in text.split(';') {
            let unit = unit.trim().trim_start_matches(':');
            if unit.is_empty() {
                continue;
            }
            let (header, args) = match unit.split_once(' ') {
                Some((header, args)) => (header, args.trim()),
                None => (unit, ""),
            };

            match header.to_ascii_uppercase().as_str() {
                "*IDN?" => parts.push(IDN.into()),
                "*OPT?" => parts.push(b"K1,K20,\"B4\"".to_vec()),
                "*RST" => {
                    self.format = DataFormat::Ascii;
                    self.swapped = true;
                    self.frequency = 1e9;
                }
                "*CLS" => {
                    self.errors.clear();
                    self.opc_armed = false;
                }
                "*OPC?" => {
                    tokio::time::sleep_until(self.busy_until).await;
                    parts.push(b"1".to_vec());
                }
                "*OPC" => self.opc_armed = true,
                "*ESR?" => {
                    let mut esr = 0;
                    if self.opc_armed && Instant::now() >= self.busy_until {
                        esr |= 1;
                        self.opc_armed = false;
                    }
                    parts.push(esr.to_string().into_bytes());
                }
                "*TST?" => {
                    self.start_operation();
                    tokio::time::sleep_until(self.busy_until).await;
                    let result = self.state.self_test_result.lock().unwrap().clone();
                    parts.push(result.unwrap_or_else(|| "0".into()).into_bytes());
                }
                "&GTL" => self.state.local.store(true, Ordering::SeqCst),
                "&GTR" => self.state.local.store(false, Ordering::SeqCst),
                "SING" => self.start_operation(),
                "SYST:ERR?" => {
                    let (code, message) = self
                        .errors
                        .pop_front()
                        .unwrap_or((0, "No error".to_string()));
                    parts.push(format!("{code},\"{message}\"").into_bytes());
                }
                "STAT:OPER:COND?" => {
                    let n = self.state.condition_queries.fetch_add(1, Ordering::SeqCst) + 1;
                    parts.push(n.to_string().into_bytes());
                }
                "FREQ" => match args.parse() {
                    Ok(freq) => self.frequency = freq,
                    Err(_) => self.push_error(-222, "Data out of range".into()),
                },
                "FREQ?" => parts.push(self.frequency.to_string().into_bytes()),
                "FORM" => match args.to_ascii_uppercase().replace(' ', "").as_str() {
                    "ASC" | "ASCII" => self.format = DataFormat::Ascii,
                    "REAL,32" => self.format = DataFormat::Real32,
                    "REAL,64" => self.format = DataFormat::Real64,
                    _ => self.push_error(-224, "Illegal parameter value".into()),
                },
                "FORM:BORD" => match args.to_ascii_uppercase().as_str() {
                    "SWAP" => self.swapped = true,
                    "NORM" => self.swapped = false,
                    _ => self.push_error(-224, "Illegal parameter value".into()),
                },
                "TRAC:DATA?" => match self.format {
                    DataFormat::Ascii => parts.push(
                        TRACE
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(",")
                            .into_bytes(),
                    ),
                    _ => parts.push(encode_block(&self.bin_format().encode(&TRACE))),
                },
                "MMEM:DATA?" => {
                    let path = unquote(args);
                    let data = self.state.files.lock().unwrap().get(path).cloned();
                    match data {
                        Some(data) => parts.push(encode_block(&data)),
                        None => self.push_error(-256, format!("File name not found;{path}")),
                    }
                }
                "MMEM:DEL" => {
                    let path = unquote(args);
                    if self.state.files.lock().unwrap().remove(path).is_none() {
                        self.push_error(-256, format!("File name not found;{path}"));
                    }
                }
                _ => self.push_error(-113, format!("Undefined header;{unit}")),
            }
        }

        if parts.is_empty() {
            return None;
        }
        let mut reply = parts.join(&b';');
        reply.push(b'\n');
        Some(reply)
    }

    fn handle_block(&mut self, header: &str, data: Vec<u8>) {
        let (cmd, args) = header.split_once(' ').unwrap_or((header, ""));
        let path = unquote(args.trim().trim_end_matches(','));

        let error = {
            let mut files = self.state.files.lock().unwrap();
            match cmd.to_ascii_uppercase().as_str() {
                "MMEM:DATA" => {
                    files.insert(path.to_string(), data);
                    None
                }
                "MMEM:DATA:APP" if path.starts_with("/ro/") => {
                    Some((-250, format!("Mass storage error;{path}")))
                }
                "MMEM:DATA:APP" => match files.get_mut(path) {
                    Some(file) => {
                        file.extend_from_slice(&data);
                        None
                    }
                    None => Some((-256, format!("File name not found;{path}"))),
                },
                _ => Some((-113, format!("Undefined header;{cmd}"))),
            }
        };

        if let Some((code, message)) = error {
            self.push_error(code, message);
        }
    }
}

fn unquote(arg: &str) -> &str {
    arg.trim().trim_matches('\'').trim_matches('"')
}

async fn read_message(rd: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<Message>> {
    let mut head = vec![];

    loop {
        let byte = match rd.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };

        match byte {
            b'\n' => {
                let text = String::from_utf8_lossy(&head).trim().to_string();
                return Ok(Some(Message::Text(text)));
            }
            b'#' => {
                let n = (rd.read_u8().await? - b'0') as usize;
                let mut digits = vec![0; n];
                rd.read_exact(&mut digits).await?;
                let length: usize = String::from_utf8_lossy(&digits).parse().unwrap_or(0);
                let mut data = vec![0; length];
                rd.read_exact(&mut data).await?;
                let mut rest = vec![];
                rd.read_until(b'\n', &mut rest).await?;

                let header = String::from_utf8_lossy(&head).trim().to_string();
                return Ok(Some(Message::WithBlock { header, data }));
            }
            _ => head.push(byte),
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<SimState>) -> std::io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut conn = Connection {
        state,
        errors: VecDeque::new(),
        busy_until: Instant::now(),
        opc_armed: false,
        format: DataFormat::Ascii,
        swapped: true,
        frequency: 1e9,
    };

    while let Some(msg) = read_message(&mut rd).await? {
        match msg {
            Message::Text(text) => {
                if let Some(reply) = conn.handle_text(&text).await {
                    wr.write_all(&reply).await?;
                }
            }
            Message::WithBlock { header, data } => conn.handle_block(&header, data),
        }
    }

    Ok(())
}
