// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    fmt,
    mem,
    net::Ipv4Addr,
    slice,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// An IPv4 network address in native socket address layout. The byte image
/// is exactly what the OS expects for bind and connect, so it can be handed
/// to the kernel without translation.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Endpoint {
    /// Native address record, fields in network byte order where the OS
    /// requires it.
    inner: libc::sockaddr_in,
}

// Bind and connect hand the kernel a pointer to this record with its size;
// both must match the native layout exactly.
const _: () = assert!(mem::size_of::<Endpoint>() == mem::size_of::<libc::sockaddr_in>());
const _: () = assert!(mem::size_of::<Endpoint>() == 16);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Endpoint {
    /// Size of the native address record in bytes.
    pub const SIZE: usize = mem::size_of::<libc::sockaddr_in>();

    /// Creates an endpoint from an address and a port.
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            inner: libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(addr).to_be(),
                },
                sin_zero: [0; 8],
            },
        }
    }

    /// The wildcard endpoint: any local address, ephemeral port.
    pub fn any() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, 0)
    }

    /// Wraps a native address record produced by the OS.
    pub(crate) fn from_raw(inner: libc::sockaddr_in) -> Self {
        Self { inner }
    }

    /// The IPv4 address.
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.inner.sin_addr.s_addr))
    }

    /// The port, in host byte order.
    pub fn port(&self) -> u16 {
        u16::from_be(self.inner.sin_port)
    }

    /// Pointer to the native record, for passing to address-taking syscalls
    /// together with [Self::SIZE]. Valid for as long as the endpoint is.
    pub(crate) fn as_raw(&self) -> *const libc::sockaddr {
        (&self.inner as *const libc::sockaddr_in).cast::<libc::sockaddr>()
    }

    /// The native byte image of the address. Parked in an operation context
    /// when a submitted operation needs the address to outlive the caller.
    pub(crate) fn image(&self) -> Vec<u8> {
        // Plain data record; the cast reads its raw bytes.
        let bytes: &[u8] = unsafe { slice::from_raw_parts((self as *const Self).cast::<u8>(), Self::SIZE) };
        bytes.to_vec()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr(), self.port())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.inner.sin_family == other.inner.sin_family
            && self.inner.sin_port == other.inner.sin_port
            && self.inner.sin_addr.s_addr == other.inner.sin_addr.s_addr
    }
}

impl Eq for Endpoint {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Endpoint;
    use ::anyhow::Result;
    use ::std::net::Ipv4Addr;

    /// Tests if address and port survive the native encoding.
    #[test]
    fn round_trip() -> Result<()> {
        let endpoint: Endpoint = Endpoint::new(Ipv4Addr::new(10, 0, 0, 13), 8080);
        crate::ensure_eq!(endpoint.addr(), Ipv4Addr::new(10, 0, 0, 13));
        crate::ensure_eq!(endpoint.port(), 8080);
        crate::ensure_eq!(format!("{}", endpoint), "10.0.0.13:8080");
        Ok(())
    }

    /// Tests if the byte image carries the port in network byte order.
    #[test]
    fn image_is_native_layout() -> Result<()> {
        let endpoint: Endpoint = Endpoint::new(Ipv4Addr::LOCALHOST, 0x1234);
        let image: Vec<u8> = endpoint.image();
        crate::ensure_eq!(image.len(), Endpoint::SIZE);
        // sin_port sits at offset 2, big endian.
        crate::ensure_eq!(image[2], 0x12);
        crate::ensure_eq!(image[3], 0x34);
        // sin_addr at offset 4, big endian: 127.0.0.1.
        crate::ensure_eq!(&image[4..8], &[127, 0, 0, 1]);
        Ok(())
    }

    /// Tests the wildcard endpoint.
    #[test]
    fn wildcard() -> Result<()> {
        let endpoint: Endpoint = Endpoint::any();
        crate::ensure_eq!(endpoint.addr(), Ipv4Addr::UNSPECIFIED);
        crate::ensure_eq!(endpoint.port(), 0);
        Ok(())
    }
}
