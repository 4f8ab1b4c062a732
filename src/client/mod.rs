/// RPC client: sends requests and awaits correlated replies.
mod rpc_client;

pub use rpc_client::{Reply, RpcClient};
