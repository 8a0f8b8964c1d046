use super::{
    catalog::{CatalogIngester, CATALOG_IDLE_FLUSH},
    device::{DeviceEntry, Registry},
    record::RecordWaiters,
    session::{SsrcAllocator, StreamSession},
    xml,
};
use crate::config::{MediaConfig, SipConfig};
use crate::store::Storer;
use crate::transaction::{
    endpoint::Endpoint, make_call_id, make_tag, make_via_branch, random_sn,
    transaction::Transaction, wait_final_response,
};
use crate::zlm::MediaClient;
use crate::{bz, Error, Result};
use dashmap::DashMap;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, Param};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub(crate) const INVITE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

pub const CONTENT_TYPE_XML: &str = "Application/MANSCDP+xml";
pub const CONTENT_TYPE_SDP: &str = "APPLICATION/SDP";
pub const CONTENT_TYPE_MANSRTSP: &str = "Application/MANSRTSP";

/// The GB28181 signaling server: request router state, device registry,
/// stream sessions and the outbound command surface.
pub struct GbServer {
    pub cfg: SipConfig,
    pub media_cfg: MediaConfig,
    pub endpoint: Arc<Endpoint>,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn Storer>,
    pub zlm: Arc<MediaClient>,
    pub(crate) sessions: DashMap<String, StreamSession>,
    pub(crate) catalog: CatalogIngester,
    pub(crate) records: RecordWaiters,
    pub(crate) nonces: DashMap<String, Instant>,
    pub(crate) alarm_tx: broadcast::Sender<xml::AlarmNotify>,
    pub(crate) ssrc: SsrcAllocator,
    cseq: AtomicU32,
}

pub type GbServerRef = Arc<GbServer>;

impl GbServer {
    pub fn new(
        cfg: SipConfig,
        media_cfg: MediaConfig,
        endpoint: Arc<Endpoint>,
        registry: Arc<Registry>,
        store: Arc<dyn Storer>,
        zlm: Arc<MediaClient>,
    ) -> GbServerRef {
        let (alarm_tx, _) = broadcast::channel(64);
        let ssrc = SsrcAllocator::new(&cfg.domain);
        Arc::new(GbServer {
            cfg,
            media_cfg,
            endpoint,
            registry,
            store,
            zlm,
            sessions: DashMap::new(),
            catalog: CatalogIngester::new(),
            records: RecordWaiters::new(),
            nonces: DashMap::new(),
            alarm_tx,
            ssrc,
            cseq: AtomicU32::new(1),
        })
    }

    /// Consume incoming server transactions until the endpoint shuts down.
    /// Each request is handled on its own task.
    pub async fn serve(self: &Arc<Self>) {
        let mut incoming = self.endpoint.incoming_transactions();
        let flusher = self.clone();
        tokio::spawn(async move {
            flusher.catalog_flush_loop().await;
        });

        info!(
            id = %self.cfg.id,
            domain = %self.cfg.domain,
            "GB28181 server serving"
        );
        while let Some(tx) = incoming.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                let method = tx.original.method.clone();
                if let Err(e) = super::handler::dispatch(server, tx).await {
                    warn!("handle {} failed: {}", method, e);
                }
            });
        }
    }

    /// Observer stream for device alarms.
    pub fn subscribe_alarms(&self) -> broadcast::Receiver<xml::AlarmNotify> {
        self.alarm_tx.subscribe()
    }

    async fn catalog_flush_loop(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            for (device_id, items) in self.catalog.drain_idle(CATALOG_IDLE_FLUSH) {
                debug!(
                    device_id = %device_id,
                    count = items.len(),
                    "flushing idle catalog batch"
                );
                if let Err(e) = self.save_channels(&device_id, items).await {
                    warn!("catalog flush failed: {}", e);
                }
            }
        }
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn server_uri(&self) -> Result<rsip::Uri> {
        rsip::Uri::try_from(format!("sip:{}@{}", self.cfg.id, self.cfg.domain).as_str())
            .map_err(Into::into)
    }

    /// Build an outbound in-domain request addressed at a device or channel
    /// id, routed to the device's last registered source over the
    /// connection it registered on.
    pub(crate) fn device_request(
        &self,
        to_id: &str,
        entry: &DeviceEntry,
        method: Method,
        content_type: Option<&str>,
        body: Vec<u8>,
        extra_headers: Vec<Header>,
    ) -> Result<Transaction> {
        let via = self.endpoint.get_via(None, Some(make_via_branch()))?;
        let from = rsip::typed::From {
            display_name: None,
            uri: self.server_uri()?,
            params: vec![Param::Tag(make_tag())],
        };
        let to_uri =
            rsip::Uri::try_from(format!("sip:{}@{}", to_id, self.cfg.domain).as_str())?;
        let to = rsip::typed::To {
            display_name: None,
            uri: to_uri.clone(),
            params: vec![],
        };

        let request_uri = match &entry.source {
            Some(source) => {
                rsip::Uri::try_from(format!("sip:{}@{}", to_id, source.addr).as_str())?
            }
            None => to_uri,
        };

        let mut headers: Vec<Header> = vec![
            Header::Via(via.into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CallId(make_call_id(&self.cfg.domain)),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: self.next_cseq(),
                    method: method.clone(),
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.endpoint.inner_ref().user_agent.clone().into()),
        ];
        if method == Method::Invite {
            headers.push(
                rsip::typed::Contact {
                    display_name: None,
                    uri: self.server_uri()?,
                    params: vec![],
                }
                .into(),
            );
        }
        if let Some(content_type) = content_type {
            headers.push(Header::ContentType(content_type.into()));
        }
        headers.extend(extra_headers);
        headers.push(Header::ContentLength((body.len() as u32).into()));

        let request = rsip::Request {
            method,
            uri: request_uri,
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        };

        let mut tx = self.endpoint.client_transaction(request)?;
        tx.destination = entry.source.clone();
        tx.connection = entry.connection.clone();
        Ok(tx)
    }

    /// In-dialog request rebuilt from a stored 2xx: To/From/Call-ID carried
    /// over, CSeq bumped for BYE/INFO, request URI from the Contact.
    pub(crate) fn request_from_response(
        &self,
        method: Method,
        resp: &rsip::Response,
        bump_cseq: bool,
    ) -> Result<rsip::Request> {
        let cseq = resp.cseq_header()?.typed()?;
        let seq = if bump_cseq { cseq.seq + 1 } else { cseq.seq };

        let uri = match resp.contact_header() {
            Ok(contact) => contact.typed()?.uri,
            Err(_) => resp.to_header()?.typed()?.uri,
        };

        let via = self.endpoint.get_via(None, Some(make_via_branch()))?;
        let headers: Vec<Header> = vec![
            Header::Via(via.into()),
            Header::From(resp.from_header()?.clone()),
            Header::To(resp.to_header()?.clone()),
            Header::CallId(resp.call_id_header()?.clone()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq,
                    method: method.clone(),
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
            Header::ContentLength(0.into()),
        ];

        Ok(rsip::Request {
            method,
            uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        })
    }

    /// Fire a MESSAGE and wait for its final response.
    pub(crate) async fn message_request(
        &self,
        to_id: &str,
        entry: &DeviceEntry,
        body: String,
        extra_headers: Vec<Header>,
    ) -> Result<rsip::Response> {
        let mut tx = self.device_request(
            to_id,
            entry,
            Method::Message,
            Some(CONTENT_TYPE_XML),
            body.into_bytes(),
            extra_headers,
        )?;
        tx.send().await?;
        match tokio::time::timeout(MESSAGE_TIMEOUT, wait_final_response(&mut tx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("MESSAGE to {}", to_id))),
        }
    }

    /// Fire a MESSAGE without caring about the answer.
    pub(crate) async fn message_request_no_wait(
        &self,
        to_id: &str,
        entry: &DeviceEntry,
        body: String,
    ) -> Result<()> {
        let mut tx = self.device_request(
            to_id,
            entry,
            Method::Message,
            Some(CONTENT_TYPE_XML),
            body.into_bytes(),
            vec![],
        )?;
        tx.send().await
    }

    /// Ask a device for its catalog; responses arrive as separate MESSAGEs
    /// handled by the router.
    pub async fn query_catalog(&self, device_id: &str) -> Result<()> {
        let entry = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        let body = xml::CatalogQuery::new(random_sn(), device_id).to_xml()?;
        self.message_request_no_wait(device_id, &entry, body).await
    }

    pub async fn query_device_info(&self, device_id: &str) -> Result<()> {
        let entry = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        let body = xml::DeviceInfoQuery::new(random_sn(), device_id).to_xml()?;
        self.message_request_no_wait(device_id, &entry, body).await
    }

    /// Upsert one completed catalog batch and refresh the device's channel
    /// count. Channels that disappeared from the device's catalog are left
    /// alone; removing them is an administrative action.
    pub(crate) async fn save_channels(
        &self,
        device_id: &str,
        items: Vec<xml::CatalogItem>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let device = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        let did = device.device.id.clone();
        let total = items.len();

        for item in items {
            let existing = self.registry.get_channel(device_id, &item.device_id);
            let mut channel = match existing {
                Some(channel) => channel,
                None => {
                    let mut channel = super::device::Channel::new(device_id, &item.device_id);
                    channel.id = bz::unique_id(bz::ID_PREFIX_GB_CHANNEL);
                    channel
                }
            };
            channel.did = did.clone();
            channel.name = item.name.clone();
            channel.manufacturer = item.manufacturer.clone();
            channel.model = item.model.clone();
            channel.status = item.status.clone();
            channel.is_online = item.is_on();

            if self
                .store
                .channel()
                .get(device_id, &item.device_id)
                .await
                .is_ok()
            {
                let update = channel.clone();
                self.store
                    .channel()
                    .edit(
                        device_id,
                        &item.device_id,
                        Box::new(move |c| {
                            c.did = update.did;
                            c.name = update.name;
                            c.manufacturer = update.manufacturer;
                            c.model = update.model;
                            c.status = update.status;
                            c.is_online = update.is_online;
                        }),
                    )
                    .await?;
            } else {
                self.store.channel().add(&channel).await?;
            }
            self.registry.store_channel(channel);
        }

        self.registry.change(device_id, |entry| {
            entry.device.channels = total;
        })?;
        self.store
            .device()
            .edit(device_id, Box::new(move |d| d.channels = total))
            .await
            .ok();
        info!(device_id = %device_id, channels = total, "catalog saved");
        Ok(())
    }
}
