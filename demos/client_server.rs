//! Runnable client/server example over the `bmi-rdma` facade, generalized
//! from the teacher's `examples/client_server.rs` byte-ping demo into a
//! tagged eager round-trip against [`BmiDevice`].

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bmi_rdma::{BackendKind, Buflist, BmiDevice, Tunables};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum Mode {
    Client,
    Server,
}

impl FromStr for Mode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Client" | "client" => Ok(Mode::Client),
            "Server" | "server" => Ok(Mode::Server),
            _ => Err("Unknown mode. Available modes: 'client', 'server'."),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "bmi-rdma Client/Server",
    about = "Example BMI-RDMA Client/Server Program."
)]
struct Opt {
    #[structopt(short, long)]
    mode: Mode,
    #[structopt(short, long)]
    ip_address: String,
    #[structopt(short, long)]
    port: u16,
}

const PING_TAG: u32 = 1;

fn main() {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .without_time()
        .init();

    let opt = Opt::from_args();
    let mut device = BmiDevice::init(Tunables::default(), BackendKind::Tcp)
        .expect("device init failed");

    match opt.mode {
        Mode::Server => {
            let address: SocketAddr = format!("{}:{}", opt.ip_address, opt.port)
                .parse()
                .expect("unable to parse socket address");
            device.listen(address).expect("listen failed");
            let peer = device.accept().expect("accept failed");
            println!("Connected to client!");

            let mut buf = vec![0u8; 1];
            let bl = Buflist::new(vec![(buf.as_mut_ptr() as usize, buf.len())]);
            let recv_id = device
                .post_recv(peer, bl, PING_TAG, 0)
                .expect("post_recv failed");

            println!("Waiting to receive byte...");
            let completion = device
                .test(recv_id, Duration::from_secs(30))
                .expect("test failed")
                .expect("recv timed out");
            println!("Server got: {:?} (status {:?})", buf[0], completion.status);
        }
        Mode::Client => {
            let url = format!("ib://{}:{}", opt.ip_address, opt.port);
            let peer = device.connect(&url, true).expect("connect failed");

            println!("Sending byte to server.");
            let mut payload = vec![42u8];
            let bl = Buflist::new(vec![(payload.as_mut_ptr() as usize, payload.len())]);
            let send_id = device
                .post_send(peer, bl, payload.len(), PING_TAG, 0)
                .expect("post_send failed");

            device
                .test(send_id, Duration::from_secs(30))
                .expect("test failed")
                .expect("send timed out");
            println!("Byte sent!");
        }
    }

    device.finalize().expect("finalize failed");
}
