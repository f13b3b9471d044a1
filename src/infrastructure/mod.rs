//! Infrastructure layer - sockets, protocols and media

pub mod media;
pub mod net;
pub mod protocols;
