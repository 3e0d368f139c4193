use tracing::debug;
use zbus::{
    fdo::{Error, Result},
    interface, message,
    object_server::{ResponseDispatchNotifier, SignalEmitter},
};

use super::msg_sender;
use crate::{
    fdo::dbus::{changed_bus_name, emit_name_lost, emit_name_owner_changed},
    router::Router,
    rules::MatchRules,
};

#[derive(Debug)]
pub struct Monitoring {
    router: Router,
}

impl Monitoring {
    pub const PATH: &'static str = "/org/freedesktop/DBus";
    pub const INTERFACE: &'static str = "org.freedesktop.DBus.Monitoring";

    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[interface(
    interface = "org.freedesktop.DBus.Monitoring",
    introspection_docs = false
)]
impl Monitoring {
    async fn become_monitor(
        &self,
        match_rules: MatchRules,
        _flags: u32,
        #[zbus(header)] hdr: message::Header<'_>,
        #[zbus(signal_emitter)] ctxt: SignalEmitter<'_>,
    ) -> Result<ResponseDispatchNotifier<()>> {
        let owner = msg_sender(&hdr).to_owned();
        if self.router.become_monitor(owner.as_ref(), match_rules).is_none() {
            return Err(Error::NameHasNoOwner(format!("No such peer: {}", owner)));
        }
        debug!("{} became a monitor", owner);

        // Emit the name-release signals **after** the `BecomeMonitor` call
        // itself returns, same as the ordinary `Hello`/`RequestName` path:
        // some clients (e.g. `busctl monitor`) get confused otherwise.
        let (response, listener) = ResponseDispatchNotifier::new(());
        let router = self.router.clone();
        let ctxt = ctxt.to_owned();
        tokio::spawn(async move {
            listener.await;

            let changes = router.name_registry().release_all(owner.as_ref());
            for changed in changes {
                emit_name_owner_changed(&ctxt, &changed).await;

                let name = changed_bus_name(&changed);
                let ctxt = ctxt.clone().set_destination(owner.clone().into());
                emit_name_lost(&ctxt, name).await;
            }
        });

        Ok(response)
    }
}
