use log::{info, warn, LevelFilter};
use std::cell::RefCell;
use std::env;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::IntoRawFd;
use std::rc::Rc;

use evloop::common::Logger;
use evloop::config::{Config, ConfigLoader};
use evloop::core::fd::{FdConfig, FdHandler, FdReceiver};
use evloop::core::net::{AcceptReceiver, TcpServer};
use evloop::sources::{block_signals, SignalHandler, SignalReceiver};
use evloop::{EventLoop, Outcome, Result};

fn main() {
    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => ConfigLoader::load(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    let level = match config.engine.log_level.as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if let Err(e) = Logger::init(level) {
        eprintln!("Error installing logger: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = serve(config) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn serve(config: Config) -> Result<()> {
    let signals = [libc::SIGINT, libc::SIGTERM];
    block_signals(&signals)?;

    let lp = Rc::new(EventLoop::with_capacity(config.engine.max_events)?);
    lp.set_timeout(config.engine.timeout_ms);

    let shutdown = SignalHandler::new(&lp, Box::new(Shutdown));
    shutdown.borrow_mut().init(&signals)?;

    let acceptor = EchoAcceptor {
        lp: Rc::clone(&lp),
        conns: Rc::new(RefCell::new(Vec::new())),
        rx_capacity: config.server.rx_capacity,
        tx_capacity: config.server.tx_capacity,
    };
    let server = TcpServer::new(&lp, Box::new(acceptor));
    let addr = SocketAddr::new(config.server.address, config.server.port);
    server.borrow_mut().listen(addr)?;
    info!("echo service listening on {}", addr);

    lp.run()
}

/// Normal shutdown on the first received signal.
struct Shutdown;

impl SignalReceiver for Shutdown {
    fn signal(
        &mut self,
        _sh: &mut SignalHandler,
        info: &libc::signalfd_siginfo,
    ) -> Outcome {
        log::info!("received signal {}, shutting down", info.ssi_signo);
        Outcome::Stop
    }
}

/// Accepts connections and wires each one to an echo adapter.
struct EchoAcceptor {
    lp: Rc<EventLoop>,
    conns: Rc<RefCell<Vec<Rc<RefCell<FdHandler>>>>>,
    rx_capacity: usize,
    tx_capacity: usize,
}

impl AcceptReceiver for EchoAcceptor {
    fn accepted(
        &mut self,
        _srv: &mut TcpServer,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Outcome {
        // closed adapters linger in the list until the next accept
        self.conns
            .borrow_mut()
            .retain(|conn| conn.borrow().fd().is_some());

        let fdh = FdHandler::with_receiver(&self.lp, Box::new(Echo));
        let cfg = FdConfig {
            rx_capacity: self.rx_capacity,
            tx_capacity: self.tx_capacity,
            read_enabled: true,
            write_enabled: false,
            register: true,
        };
        let init_result = fdh.borrow_mut().init_owned(stream.into_raw_fd(), &cfg);
        match init_result {
            Ok(()) => {
                info!("accepted connection from {}", peer);
                self.conns.borrow_mut().push(fdh);
            }
            Err(e) => warn!("setting up connection from {} failed: {}", peer, e),
        }
        Outcome::Continue
    }
}

/// Echoes received bytes back to the peer. Connection-level failures close
/// that connection but never stop the service.
struct Echo;

impl FdReceiver for Echo {
    fn rx(&mut self, fdh: &mut FdHandler, len: io::Result<usize>) -> Outcome {
        match len {
            Ok(0) => {
                info!("connection closed by peer");
                fdh.close();
            }
            Ok(_) => {
                let data = fdh.rx_buffer().readable().to_vec();
                fdh.rx_buffer_mut().clear();
                if let Err(e) = fdh.write_stream(&data) {
                    warn!("echoing failed: {}", e);
                    fdh.close();
                }
            }
            Err(e) => {
                warn!("connection read failed: {}", e);
                fdh.close();
            }
        }
        Outcome::Continue
    }

    fn tx(&mut self, fdh: &mut FdHandler, len: io::Result<usize>) -> Outcome {
        match len {
            Ok(_) => fdh.tx_buffer_mut().compact(),
            Err(e) => {
                warn!("connection write failed: {}", e);
                fdh.close();
            }
        }
        Outcome::Continue
    }

    fn hangup(&mut self, fdh: &mut FdHandler) -> Outcome {
        fdh.close();
        Outcome::Continue
    }

    fn error(&mut self, fdh: &mut FdHandler) -> Outcome {
        fdh.close();
        Outcome::Continue
    }
}
