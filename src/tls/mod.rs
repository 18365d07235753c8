pub(crate) mod connector;

pub use self::connector::{Connector, TlsConnect};
