pub mod dns;
pub mod docker;
pub mod etcd;
pub mod http;
pub mod revhttp;
pub mod socks;

pub use dns::DnsServer;
pub use docker::DockerClient;
pub use etcd::EtcdClient;
pub use http::HttpProxy;
pub use revhttp::RevHttpProxy;
pub use socks::SocksProxy;
