//! The control API (component H): what a CLI or UI shell drives the supervisor through.
//! `Command` is the wire between the two; `Control` is the async-trait facade callers
//! program against, and [`EngineHandle`] is its `flume`-backed implementation.
//!
//! Grounded on `yuv_p2p::client::handle::Handle`: an async trait over a client the
//! caller never touches directly, one concrete handle implementing it, and a
//! `mockall::mock!` double gated behind `cfg(any(test, feature = "mocks"))` for callers
//! who want to stub the engine out in their own tests.
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use hsync_types::network::Height;
use hsync_types::peer::PeerDescriptor;
use hsync_types::protocol::RpcError;
use hsync_types::proxy::ProxyDescriptor;

use crate::router::SubscriptionCallback;

/// How long [`EngineHandle`]'s synchronous calls wait for the supervisor to reply
/// before giving up. Well above [`hsync_types::network::REQUEST_TIMEOUT`] so a
/// legitimately slow main-peer round trip doesn't race the handle's own timeout.
const SYNCHRONOUS_TIMEOUT: Duration = Duration::from_secs(30);

/// A message sent to the supervisor loop, the only place any of this is acted on.
pub enum Command {
    /// Issue a one-shot RPC to the main peer and deliver its response.
    Synchronous {
        /// RPC method name.
        method: String,
        /// Positional parameters.
        params: Vec<Value>,
        /// Where to deliver the result.
        reply: oneshot::Sender<Result<Value, ControlError>>,
    },
    /// Register a subscription callback, replaying any cached value synchronously.
    Subscribe {
        /// RPC method name (e.g. `blockchain.scripthash.subscribe`).
        method: String,
        /// Positional parameters; only the first participates in subscription identity.
        params: Vec<Value>,
        /// Invoked on the initial cached replay (if any) and every subsequent push.
        callback: SubscriptionCallback,
        /// Delivers the cached value at registration time, or `None` if nothing cached yet.
        reply: oneshot::Sender<Option<Value>>,
    },
    /// Update the configured server/proxy/auto-connect/oneserver knobs.
    SetParameters {
        /// New default server, if changed.
        server: Option<PeerDescriptor>,
        /// New proxy, if changed.
        proxy: Option<ProxyDescriptor>,
        /// New auto-connect setting.
        auto_connect: bool,
        /// New one-server setting.
        oneserver: bool,
    },
    /// Force a switch of the main peer.
    SwitchToInterface(String),
    /// List currently connected peer ids.
    GetInterfaces(oneshot::Sender<Vec<String>>),
    /// Group connected peers by the chain branch they're attached to.
    GetBlockchains(oneshot::Sender<Vec<(Height, Vec<String>)>>),
    /// Shut the supervisor down.
    Stop,
}

/// Errors an [`EngineHandle`] call can report.
#[derive(Debug, Error)]
pub enum ControlError {
    /// No main peer is currently attached to route the request through.
    #[error("no main peer is currently connected")]
    NoMainPeer,
    /// The main peer reported an RPC error for this request.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The supervisor loop is no longer running.
    #[error("engine is shut down")]
    Disconnected,
    /// The reply didn't arrive within [`SYNCHRONOUS_TIMEOUT`].
    #[error("request to engine timed out")]
    Timeout,
}

/// What a CLI or UI shell drives the engine through, independent of the flume/oneshot
/// plumbing underneath.
#[async_trait]
pub trait Control: Sized + Send + Sync + Clone {
    /// Issue a one-shot RPC to the main peer.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ControlError>;
    /// Subscribe to pushes for `method`/`params`, replaying the cached value if any.
    async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: SubscriptionCallback,
    ) -> Result<Option<Value>, ControlError>;
    /// Update configured server/proxy/auto-connect/oneserver.
    async fn set_parameters(
        &self,
        server: Option<PeerDescriptor>,
        proxy: Option<ProxyDescriptor>,
        auto_connect: bool,
        oneserver: bool,
    ) -> Result<(), ControlError>;
    /// Force a switch of the main peer.
    async fn switch_to_interface(&self, peer_id: String) -> Result<(), ControlError>;
    /// List currently connected peer ids.
    async fn get_interfaces(&self) -> Result<Vec<String>, ControlError>;
    /// Group connected peers by the chain branch they're attached to.
    async fn get_blockchains(&self) -> Result<Vec<(Height, Vec<String>)>, ControlError>;
    /// Ask the supervisor to stop.
    async fn stop(&self) -> Result<(), ControlError>;
}

/// A cloneable handle onto a running [`crate::supervisor::Supervisor`], talking to it
/// over a `flume` command channel.
#[derive(Clone)]
pub struct EngineHandle {
    commands: flume::Sender<Command>,
}

impl EngineHandle {
    /// Wrap a raw command sender. Constructed by whoever spawns the supervisor loop.
    pub fn new(commands: flume::Sender<Command>) -> Self {
        Self { commands }
    }

    async fn send(&self, command: Command) -> Result<(), ControlError> {
        self.commands
            .send_async(command)
            .await
            .map_err(|_| ControlError::Disconnected)
    }

    async fn reply<T>(rx: oneshot::Receiver<T>) -> Result<T, ControlError> {
        tokio::time::timeout(SYNCHRONOUS_TIMEOUT, rx)
            .await
            .map_err(|_| ControlError::Timeout)?
            .map_err(|_| ControlError::Disconnected)
    }
}

#[async_trait]
impl Control for EngineHandle {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Synchronous {
            method: method.to_string(),
            params,
            reply,
        })
        .await?;
        Self::reply(rx).await?
    }

    async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: SubscriptionCallback,
    ) -> Result<Option<Value>, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            method: method.to_string(),
            params,
            callback,
            reply,
        })
        .await?;
        Self::reply(rx).await
    }

    async fn set_parameters(
        &self,
        server: Option<PeerDescriptor>,
        proxy: Option<ProxyDescriptor>,
        auto_connect: bool,
        oneserver: bool,
    ) -> Result<(), ControlError> {
        self.send(Command::SetParameters {
            server,
            proxy,
            auto_connect,
            oneserver,
        })
        .await
    }

    async fn switch_to_interface(&self, peer_id: String) -> Result<(), ControlError> {
        self.send(Command::SwitchToInterface(peer_id)).await
    }

    async fn get_interfaces(&self) -> Result<Vec<String>, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetInterfaces(reply)).await?;
        Self::reply(rx).await
    }

    async fn get_blockchains(&self) -> Result<Vec<(Height, Vec<String>)>, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetBlockchains(reply)).await?;
        Self::reply(rx).await
    }

    async fn stop(&self) -> Result<(), ControlError> {
        self.send(Command::Stop).await
    }
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    /// Test double for [`Control`], for callers exercising their own code against the
    /// engine without running a real supervisor loop.
    pub EngineHandle {}

    impl Clone for EngineHandle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Control for EngineHandle {
        async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ControlError>;
        async fn subscribe(
            &self,
            method: &str,
            params: Vec<Value>,
            callback: SubscriptionCallback,
        ) -> Result<Option<Value>, ControlError>;
        async fn set_parameters(
            &self,
            server: Option<PeerDescriptor>,
            proxy: Option<ProxyDescriptor>,
            auto_connect: bool,
            oneserver: bool,
        ) -> Result<(), ControlError>;
        async fn switch_to_interface(&self, peer_id: String) -> Result<(), ControlError>;
        async fn get_interfaces(&self) -> Result<Vec<String>, ControlError>;
        async fn get_blockchains(&self) -> Result<Vec<(Height, Vec<String>)>, ControlError>;
        async fn stop(&self) -> Result<(), ControlError>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut _mock = MockEngineHandle::new();
    }

    #[tokio::test]
    async fn synchronous_call_times_out_without_a_supervisor() {
        let (tx, rx) = flume::unbounded();
        let handle = EngineHandle::new(tx);
        drop(rx);
        let err = handle.call("server.version", vec![]).await.unwrap_err();
        assert!(matches!(err, ControlError::Disconnected));
    }
}
