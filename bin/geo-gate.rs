// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::LevelFilter;

use geo_gate::server::{Server, ServerContext};

fn main() {
    unsafe { simple_logger::init().unwrap_unchecked() };

    log::set_max_level(LevelFilter::Info);

    log::info!("geo-gate tunneling gateway. v0.1.0. license under MPL-2.0.");

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            log::warn!("no config file path provided, using config.json");
            String::from("config.json")
        }
    };

    fn run_with_path(path: String) -> io::Result<()> {
        let file = File::open(path)?;
        let cfg: Config = match serde_json::from_reader(file) {
            Ok(c) => c,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        cfg.run()
    }

    if let Err(e) = run_with_path(path) {
        log::error!("exited unexpectedly: {}", e);
    }
}

#[derive(serde::Deserialize)]
pub struct Config {
    log_level: log::LevelFilter,

    listen: Vec<SocketAddr>,

    #[serde(default = "default_dns_address")]
    dns_server_address: IpAddr,
    #[serde(default = "default_dns_port")]
    dns_server_port: u16,
}

fn default_dns_address() -> IpAddr {
    std::env::var("DNS_SERVER_ADDRESS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
}

fn default_dns_port() -> u16 {
    std::env::var("DNS_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(53)
}

impl Config {
    #[inline]
    fn run(self) -> io::Result<()> {
        log::set_max_level(self.log_level);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        let ctx = Arc::new(ServerContext {
            dns_server: SocketAddr::new(self.dns_server_address, self.dns_server_port),
        });

        for bind in self.listen {
            let server = Server {
                bind,
                ctx: ctx.clone(),
            };
            rt.spawn(async move {
                if let Err(e) = server.run().await {
                    log::error!("server fatal {}", e);
                }
            });
        }

        rt.block_on(tokio::signal::ctrl_c())?;
        log::info!("SIGINT received, exiting...");

        Ok(())
    }
}
