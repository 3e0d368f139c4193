use std::{collections::HashMap, sync::Arc};

use enumflags2::BitFlags;
use tracing::warn;
use zbus::{
    fdo::{
        ConnectionCredentials, Error, ReleaseNameReply, RequestNameFlags, RequestNameReply, Result,
    },
    interface, message,
    names::{BusName, InterfaceName, OwnedBusName, OwnedUniqueName, UniqueName, WellKnownName},
    object_server::SignalEmitter,
    zvariant::Optional,
    Guid, OwnedMatchRule,
};

use crate::{name_registry::NameOwnerChanged, router::Router};

use super::msg_sender;

#[derive(Debug)]
pub struct DBus {
    unique_name: OwnedUniqueName,
    guid: Arc<Guid>,
    router: Router,
}

impl DBus {
    pub const PATH: &'static str = "/org/freedesktop/DBus";
    pub const INTERFACE: &'static str = "org.freedesktop.DBus";

    pub fn new(unique_name: OwnedUniqueName, guid: Arc<Guid>, router: Router) -> Self {
        Self {
            unique_name,
            guid,
            router,
        }
    }
}

#[interface(interface = "org.freedesktop.DBus", introspection_docs = false)]
impl DBus {
    /// Our connection is already named by the time any method call
    /// could arrive (the unique name is set while building the
    /// connection), so unlike the reference daemon's two-phase
    /// handshake, `Hello` here only needs to announce the name that
    /// already exists.
    async fn hello(
        &self,
        #[zbus(signal_emitter)] ctxt: SignalEmitter<'_>,
    ) -> Result<OwnedUniqueName> {
        let owner = UniqueName::from(self.unique_name.clone());
        if let Err(e) =
            Self::name_owner_changed(&ctxt, owner.clone().into(), None.into(), Some(owner.clone()).into())
                .await
        {
            warn!("failed to notify peers of name change: {e}");
        }
        let ctxt = ctxt.set_destination(owner.clone().into());
        if let Err(e) = Self::name_acquired(&ctxt, owner.into()).await {
            warn!("failed to send `NameAcquired` signal: {e}");
        }

        Ok(self.unique_name.clone())
    }

    async fn request_name(
        &self,
        name: WellKnownName<'_>,
        flags: BitFlags<RequestNameFlags>,
        #[zbus(header)] hdr: message::Header<'_>,
        #[zbus(signal_emitter)] ctxt: SignalEmitter<'_>,
    ) -> Result<RequestNameReply> {
        let owner = msg_sender(&hdr).to_owned().into();
        let (reply, changed) = self
            .router
            .name_registry()
            .request_name(name.to_owned().into(), owner, flags);
        if let Some(changed) = changed {
            emit_name_owner_changed(&ctxt, &changed).await;
        }

        Ok(reply)
    }

    async fn release_name(
        &self,
        name: WellKnownName<'_>,
        #[zbus(header)] hdr: message::Header<'_>,
        #[zbus(signal_emitter)] ctxt: SignalEmitter<'_>,
    ) -> Result<ReleaseNameReply> {
        let owner = msg_sender(&hdr);
        let (reply, changed) = self.router.name_registry().release_name(name, owner);
        if let Some(changed) = changed {
            emit_name_owner_changed(&ctxt, &changed).await;
        }

        Ok(reply)
    }

    async fn get_name_owner(&self, name: BusName<'_>) -> Result<OwnedUniqueName> {
        match name {
            BusName::WellKnown(name) => self
                .router
                .name_registry()
                .lookup(name)
                .ok_or_else(|| Error::NameHasNoOwner("Name is not owned by anyone. Take it!".to_string())),
            BusName::Unique(name) => self
                .router
                .endpoint(&name)
                .map(|_| name.into())
                .ok_or_else(|| Error::NameHasNoOwner("Name is not owned by anyone.".to_string())),
        }
    }

    async fn add_match(
        &self,
        rule: OwnedMatchRule,
        #[zbus(header)] hdr: message::Header<'_>,
    ) -> Result<()> {
        let owner = msg_sender(&hdr);
        self.router.add_match_rule(owner.to_owned().into(), rule);

        Ok(())
    }

    async fn remove_match(
        &self,
        rule: OwnedMatchRule,
        #[zbus(header)] hdr: message::Header<'_>,
    ) -> Result<()> {
        let owner = msg_sender(&hdr);
        self.router.remove_match_rule(owner.as_ref(), rule)
    }

    fn get_adt_audit_session_data(&self, _bus_name: BusName<'_>) -> Result<Vec<u8>> {
        Err(Error::NotSupported("Solaris really?".to_string()))
    }

    async fn get_connection_credentials(&self, bus_name: BusName<'_>) -> Result<ConnectionCredentials> {
        let owner = self.get_name_owner(bus_name.clone()).await?;
        let endpoint = self
            .router
            .endpoint(owner.as_ref())
            .ok_or_else(|| Error::Failed(format!("Peer `{bus_name}` not found")))?;

        let mut creds = ConnectionCredentials::default();
        if let Some(uid) = endpoint.uid() {
            creds = creds.set_unix_user_id(uid);
        }
        if let Some(gid) = endpoint.gid() {
            creds = creds.set_unix_group_ids([gid]);
        }

        Ok(creds)
    }

    #[zbus(name = "GetConnectionUnixProcessID")]
    async fn get_connection_unix_process_id(&self, bus_name: BusName<'_>) -> Result<u32> {
        self.get_connection_credentials(bus_name.clone())
            .await
            .and_then(|c| {
                c.process_id().ok_or_else(|| {
                    Error::UnixProcessIdUnknown(format!(
                        "Could not determine Unix process id of `{bus_name}`"
                    ))
                })
            })
    }

    async fn get_connection_unix_user(&self, bus_name: BusName<'_>) -> Result<u32> {
        self.get_connection_credentials(bus_name.clone())
            .await
            .and_then(|c| {
                c.unix_user_id().ok_or_else(|| {
                    Error::Failed(format!("Could not determine Unix user id of `{bus_name}`"))
                })
            })
    }

    fn get_id(&self) -> &Guid {
        &self.guid
    }

    fn list_activatable_names(&self) -> &[OwnedBusName] {
        &[]
    }

    async fn list_names(&self) -> Result<Vec<OwnedBusName>> {
        let mut names: Vec<OwnedBusName> = self
            .router
            .name_registry()
            .all_names()
            .into_iter()
            .map(|(name, _)| BusName::WellKnown(name.into()).into())
            .collect();
        names.extend(
            self.router
                .name_registry()
                .bus_names_snapshot()
                .into_iter()
                .map(|(unique, _)| BusName::Unique(unique.into()).into()),
        );

        Ok(names)
    }

    async fn list_queued_owners(&self, name: WellKnownName<'_>) -> Result<Vec<OwnedUniqueName>> {
        self.router
            .name_registry()
            .waiting_list(name)
            .ok_or_else(|| Error::NameHasNoOwner("Name is not owned by anyone. Take it!".to_string()))
    }

    async fn name_has_owner(&self, name: BusName<'_>) -> Result<bool> {
        match self.get_name_owner(name).await {
            Ok(_) => Ok(true),
            Err(Error::NameHasNoOwner(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn start_service_by_name(&self, _name: WellKnownName<'_>, _flags: u32) -> Result<u32> {
        Err(Error::Failed("Service activation not supported".to_string()))
    }

    fn update_activation_environment(&self, _environment: HashMap<&str, &str>) -> Result<()> {
        Err(Error::Failed("Service activation not supported".to_string()))
    }

    fn reload_config(&self) -> Result<()> {
        Err(Error::Failed("No server configuration to reload.".to_string()))
    }

    #[zbus(property)]
    fn features(&self) -> &[&str] {
        &[]
    }

    #[zbus(property)]
    fn interfaces(&self) -> &[InterfaceName<'_>] {
        &[]
    }

    #[zbus(signal)]
    pub async fn name_owner_changed(
        ctxt: &SignalEmitter<'_>,
        name: BusName<'_>,
        old_owner: Optional<UniqueName<'_>>,
        new_owner: Optional<UniqueName<'_>>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn name_lost(ctxt: &SignalEmitter<'_>, name: BusName<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn name_acquired(ctxt: &SignalEmitter<'_>, name: BusName<'_>) -> zbus::Result<()>;
}

/// The `BusName` a [`NameOwnerChanged`] is about.
pub fn changed_bus_name(changed: &NameOwnerChanged) -> BusName<'static> {
    match &changed.name {
        crate::name_registry::NameChanged::Unique(n) => BusName::Unique(n.clone().into()),
        crate::name_registry::NameChanged::WellKnown(n) => BusName::WellKnown(n.clone().into()),
    }
}

/// Broadcasts `NameOwnerChanged` over one connection. Every locally
/// connected peer needs to see this, since any of them may have an
/// `org.freedesktop.DBus` match rule on it; [`crate::router::Router`]
/// calls this once per local peer connection.
pub async fn emit_name_owner_changed(ctxt: &SignalEmitter<'_>, changed: &NameOwnerChanged) {
    let name = changed_bus_name(changed);
    let old_owner = changed.old_owner.clone().map(UniqueName::from);
    let new_owner = changed.new_owner.clone().map(UniqueName::from);

    if let Err(e) =
        DBus::name_owner_changed(ctxt, name, Optional::from(old_owner), Optional::from(new_owner)).await
    {
        warn!("failed to notify peers of name change: {e}");
    }
}

/// Sends `NameLost` to exactly the peer that owns `ctxt`'s connection;
/// the router only calls this for the one peer matching the change's
/// old owner.
pub async fn emit_name_lost(ctxt: &SignalEmitter<'_>, name: BusName<'static>) {
    if let Err(e) = DBus::name_lost(ctxt, name).await {
        warn!("failed to send `NameLost` signal: {e}");
    }
}

/// Sends `NameAcquired` to exactly the peer that owns `ctxt`'s
/// connection; the router only calls this for the one peer matching
/// the change's new owner.
pub async fn emit_name_acquired(ctxt: &SignalEmitter<'_>, name: BusName<'static>) {
    if let Err(e) = DBus::name_acquired(ctxt, name).await {
        warn!("failed to send `NameAcquired` signal: {e}");
    }
}
