/// 端点与协议标识
///
/// `Endpoint` 是对端地址，`Protocol` 选择流工厂与帧策略。二者都是纯值类型。
///
/// 反应器选择使用固定的哈希，保证同一对端在任意进程、任意次运行中落在同一个反应器上：
/// 64 位 FNV-1a，输入依次为 IP 字节（IPv4 4 字节，IPv6 16 字节）和大端序端口，
/// `reactor = hash % num_reactors`。

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 对端地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// 稳定哈希，跨进程重启保持不变
    pub fn stable_hash(&self) -> u64 {
        let mut hash = FNV_OFFSET_BASIS;
        let mut feed = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };
        match self.0.ip() {
            IpAddr::V4(v4) => feed(&v4.octets()),
            IpAddr::V6(v6) => feed(&v6.octets()),
        }
        feed(&self.0.port().to_be_bytes());
        hash
    }
}

/// 为对端选择反应器
pub fn reactor_index_for(endpoint: &Endpoint, num_reactors: usize) -> usize {
    debug_assert!(num_reactors > 0, "reactor pool must not be empty");
    if num_reactors == 0 {
        return 0;
    }
    (endpoint.stable_hash() % num_reactors as u64) as usize
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl std::str::FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 线协议标识
///
/// 以名字区分，比较和哈希都只看名字。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Protocol {
    name: &'static str,
}

impl Protocol {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// 默认的明文 TCP 协议
pub const TCP_PROTOCOL: Protocol = Protocol::new("tcp");

/// 出站连接的复用键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub remote: Endpoint,
    pub protocol: Protocol,
}

impl ConnectionKey {
    pub fn new(remote: Endpoint, protocol: Protocol) -> Self {
        Self { remote, protocol }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_known_values() {
        // 固定取值：改动哈希会让已部署节点的对端分布整体漂移
        let cases: [(&str, u64, usize); 3] = [
            ("127.0.0.1:7100", 0x8bd0_8885_71ae_b59a, 2),
            ("10.0.0.7:7000", 0x5c16_77f7_6699_582d, 5),
            ("[::1]:9000", 0x6ece_bcb1_c26f_3371, 1),
        ];
        for (addr, hash, reactor) in cases {
            let endpoint: Endpoint = addr.parse().unwrap();
            assert_eq!(endpoint.stable_hash(), hash, "{}", addr);
            assert_eq!(reactor_index_for(&endpoint, 8), reactor, "{}", addr);
        }
    }

    #[test]
    fn test_reactor_index_is_pure() {
        for port in 7000..7100u16 {
            let endpoint = Endpoint::new(SocketAddr::from(([10, 0, 0, 7], port)));
            for n in 1..9 {
                let idx = reactor_index_for(&endpoint, n);
                assert!(idx < n);
                assert_eq!(idx, reactor_index_for(&endpoint, n));
            }
        }
    }

    #[test]
    fn test_ipv6_uses_all_octets() {
        let a: Endpoint = "[::1]:9000".parse().unwrap();
        let b: Endpoint = "[::2]:9000".parse().unwrap();
        assert_ne!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn test_connection_key_display() {
        let key = ConnectionKey::new("127.0.0.1:80".parse().unwrap(), TCP_PROTOCOL);
        assert_eq!(key.to_string(), "tcp://127.0.0.1:80");
    }
}
