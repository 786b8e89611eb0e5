//! # Troupe Server
//!
//! A thin axum front end over a [`troupe::Topology`]. It terminates client
//! transports and hands everything else to the topology, so the same router
//! serves a standalone process or one node of a coordinated cluster.
//!
//! ## Routes
//!
//! | Method | Path | |
//! |---|---|---|
//! | `POST` | `/actors` | get or create an actor by name and key |
//! | `POST` | `/actors/{actor_id}/actions/{action}` | one-shot action call |
//! | `GET` | `/actors/{actor_id}/connect/websocket` | WebSocket connection |
//! | `GET` | `/actors/{actor_id}/connect/sse` | server-sent events connection |
//! | `POST` | `/actors/{actor_id}/connections/{conn_id}/message` | message for an SSE connection |
//! | `GET` | `/actors/{actor_id}/raw/websocket` | socket handed to the actor's raw handler |

pub mod error;
pub mod router;
pub mod server;
pub mod sse;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use router::{router, AppState, CONN_TOKEN_HEADER};
pub use server::TroupeServer;
