//! Typed client stubs.
//!
//! `device_client!` wraps a [`ClientProxy`](crate::client::ClientProxy) in a
//! struct with one async method per remote capability, so call sites get
//! argument and return types checked at compile time:
//!
//! ```
//! labproxy::device_client! {
//!     /// Client for a motor server.
//!     pub struct MotorClient {
//!         fn status() -> String;
//!         fn move_to(target: f64) -> f64;
//!         property position / set_position: f64;
//!         property serial: String;
//!     }
//! }
//! ```
//!
//! Methods are sent under their own name; a property `p / set_p` reads with
//! `p()` and writes with `set_p(value)`, and a property declared without a
//! setter name is read-only. Non-blocking methods are polled to
//! completion like any `ClientProxy::call`.

/// Generate a typed client for a remote device.
#[macro_export]
macro_rules! device_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $client:ident {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> $ret:ty ;
            )*
            $(
                property $prop:ident $( / $setter:ident )? : $prop_ty:ty ;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $client {
            proxy: $crate::client::ClientProxy,
        }

        #[allow(dead_code)]
        impl $client {
            /// Connect to the server at `address`; `args` construct the device
            /// if this is its first client.
            pub async fn connect(
                address: impl Into<::std::string::String>,
                args: ::std::vec::Vec<$crate::serde_json::Value>,
                options: $crate::config::ClientOptions,
            ) -> $crate::Result<Self> {
                let proxy = $crate::client::ClientProxy::connect(
                    address,
                    args,
                    $crate::serde_json::Map::new(),
                    options,
                )
                .await?;
                ::std::result::Result::Ok(Self { proxy })
            }

            pub fn from_proxy(proxy: $crate::client::ClientProxy) -> Self {
                Self { proxy }
            }

            /// The untyped proxy, for control commands and raw calls.
            pub fn proxy(&self) -> &$crate::client::ClientProxy {
                &self.proxy
            }

            $(
                $(#[$method_meta])*
                pub async fn $method(&self $(, $arg: $arg_ty)*) -> $crate::Result<$ret> {
                    let args = ::std::vec![$( $crate::protocol::to_wire(&$arg)? ),*];
                    let value = self
                        .proxy
                        .call(::std::stringify!($method), args, $crate::serde_json::Map::new())
                        .await?;
                    $crate::protocol::from_wire(value)
                }
            )*

            $(
                pub async fn $prop(&self) -> $crate::Result<$prop_ty> {
                    let value = self.proxy.get(::std::stringify!($prop)).await?;
                    $crate::protocol::from_wire(value)
                }

                $(
                    pub async fn $setter(&self, value: $prop_ty) -> $crate::Result<()> {
                        let value = $crate::protocol::to_wire(&value)?;
                        self.proxy.set(::std::stringify!($prop), value).await
                    }
                )?
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::config::{ClientOptions, ServerOptions};
    use crate::error::ProxyError;
    use crate::server::Server;
    use crate::test_support::Stage;
    use std::time::Duration;

    crate::device_client! {
        /// Typed view of the test stage.
        struct StageClient {
            fn double(n: i64) -> i64;
            fn home() -> ();
            fn slow(millis: u64, value: String) -> String;
            property x / set_x: i64;
            property label: String;
        }
    }

    #[tokio::test]
    async fn test_typed_client() {
        let mut server = Server::<Stage>::new(ServerOptions::default()).unwrap();
        let addr = server.start("127.0.0.1:0").await.unwrap();
        let options = ClientOptions {
            poll_interval: Duration::from_millis(20),
            ..ClientOptions::default()
        };

        let stage = StageClient::connect(addr.to_string(), vec![], options)
            .await
            .unwrap();
        assert_eq!(stage.double(5).await.unwrap(), 10);

        stage.set_x(3).await.unwrap();
        assert_eq!(stage.x().await.unwrap(), 3);
        stage.home().await.unwrap();
        assert_eq!(stage.x().await.unwrap(), 0);

        assert_eq!(stage.slow(50, "done".into()).await.unwrap(), "done");

        assert_eq!(stage.label().await.unwrap(), "stage-1");
        let err = stage.proxy().set("label", "other".into()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Remote(_)));

        stage.proxy().shutdown().await;
        server.stop().await;
    }
}
