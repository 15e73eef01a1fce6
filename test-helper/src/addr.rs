use std::net::{SocketAddr, TcpListener, UdpSocket};

/// Gets a new socket address allocated by the OS.
pub fn get_unused_addr() -> SocketAddr {
    let socket = TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

/// Gets a new datagram socket address allocated by the OS.
pub fn get_unused_udp_addr() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}
