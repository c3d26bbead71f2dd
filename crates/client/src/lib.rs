// caseroom-client: keeps a case's documents and chat transcript in sync with
// the server's event stream.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod reconcile;
pub mod session;
