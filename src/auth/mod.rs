//! Authentication: client bearer-token checks against the pool, and the admin
//! session-cookie login the HTML dashboard drives (dashboard itself out of scope).

pub mod middleware;
pub mod password;
pub mod session;
