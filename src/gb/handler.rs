use super::device::{Device, DeviceEntry};
use super::server::GbServerRef;
use super::xml;
use crate::transaction::{body_text, random_hex, transaction::Transaction};
use crate::transport::{SipAddr, SipConnection};
use crate::{bz, Result};
use chrono::Utc;
use rsip::headers::auth::{Algorithm, AuthQop, Qop, Scheme};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NONCE_LIFETIME: Duration = Duration::from_secs(60);
const NONCE_LEN: usize = 32;

/// Route one incoming server transaction to its handler.
pub async fn dispatch(server: GbServerRef, mut tx: Transaction) -> Result<()> {
    match tx.original.method {
        Method::Register => on_register(server, &mut tx).await,
        Method::Message => on_message(server, &mut tx).await,
        Method::Bye => on_bye(server, &mut tx).await,
        // ACK to our 2xx completes the dialog; nothing to answer
        Method::Ack => Ok(()),
        Method::Info => {
            let response = make_response(&tx.original, StatusCode::OK);
            tx.respond(response).await
        }
        _ => {
            warn!("unsupported method: {}", tx.original.method);
            let response = make_response(&tx.original, StatusCode::MethodNotAllowed);
            tx.respond(response).await
        }
    }
}

/// Response skeleton echoing the request's transaction headers.
pub(crate) fn make_response(req: &rsip::Request, status: StatusCode) -> rsip::Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_)
        )
    });
    headers.push(Header::ContentLength(0.into()));
    rsip::Response {
        status_code: status,
        headers,
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

fn device_id_from_request(req: &rsip::Request) -> Result<String> {
    let from = req.from_header()?.typed()?;
    from.uri
        .auth
        .as_ref()
        .map(|auth| auth.user.clone())
        .ok_or_else(|| crate::Error::BadRequest("From header carries no user".to_string()))
}

/// Source address taken from the patched top Via.
fn source_of(req: &rsip::Request) -> Result<SipAddr> {
    let (transport, host_with_port) = SipConnection::parse_target_from_via(req.via_header()?)?;
    Ok(SipAddr {
        r#type: Some(transport),
        addr: host_with_port,
    })
}

enum AuthOutcome {
    Accepted,
    Challenge,
    Rejected(String),
}

fn verify_digest(server: &GbServerRef, req: &rsip::Request) -> AuthOutcome {
    let Some(authorization) = req.authorization_header() else {
        return AuthOutcome::Challenge;
    };
    let authorization = match authorization.typed() {
        Ok(authorization) => authorization,
        Err(e) => return AuthOutcome::Rejected(format!("malformed Authorization: {}", e)),
    };
    if authorization.scheme != Scheme::Digest {
        return AuthOutcome::Rejected("unsupported auth scheme".to_string());
    }
    if let Some(algorithm) = authorization.algorithm {
        if algorithm != Algorithm::Md5 {
            return AuthOutcome::Rejected("unsupported digest algorithm".to_string());
        }
    }

    // single-use nonce, valid for 60 seconds
    match server.nonces.remove(&authorization.nonce) {
        Some((_, issued_at)) if issued_at.elapsed() <= NONCE_LIFETIME => {}
        _ => return AuthOutcome::Challenge,
    }

    let ha1 = md5_hex(format!(
        "{}:{}:{}",
        authorization.username, server.cfg.domain, server.cfg.password
    ));
    let ha2 = md5_hex(format!("{}:{}", req.method, authorization.uri));
    let expected = match &authorization.qop {
        Some(AuthQop::Auth { cnonce, nc }) => md5_hex(format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, authorization.nonce, nc, cnonce, ha2
        )),
        Some(AuthQop::AuthInt { .. }) => {
            return AuthOutcome::Rejected("qop auth-int not supported".to_string())
        }
        None => md5_hex(format!("{}:{}:{}", ha1, authorization.nonce, ha2)),
    };

    if expected.eq_ignore_ascii_case(&authorization.response) {
        AuthOutcome::Accepted
    } else {
        AuthOutcome::Rejected("digest mismatch".to_string())
    }
}

fn md5_hex(input: String) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

async fn challenge(server: &GbServerRef, tx: &mut Transaction) -> Result<()> {
    // drop stale nonces while we are here
    server
        .nonces
        .retain(|_, issued_at| issued_at.elapsed() <= NONCE_LIFETIME);
    let nonce = random_hex(NONCE_LEN);
    server.nonces.insert(nonce.clone(), Instant::now());

    let mut response = make_response(&tx.original, StatusCode::Unauthorized);
    response.headers.push(
        rsip::typed::WwwAuthenticate {
            scheme: Scheme::Digest,
            realm: server.cfg.domain.clone(),
            domain: None,
            nonce,
            opaque: None,
            stale: None,
            algorithm: Some(Algorithm::Md5),
            qop: Some(Qop::Auth),
            charset: None,
        }
        .into(),
    );
    tx.respond(response).await
}

async fn on_register(server: GbServerRef, tx: &mut Transaction) -> Result<()> {
    let device_id = match device_id_from_request(&tx.original) {
        Ok(device_id) => device_id,
        Err(_) => {
            let response = make_response(&tx.original, StatusCode::BadRequest);
            return tx.respond(response).await;
        }
    };

    if !server.cfg.password.is_empty() {
        match verify_digest(&server, &tx.original) {
            AuthOutcome::Accepted => {}
            AuthOutcome::Challenge => {
                debug!(device_id = %device_id, "REGISTER challenged");
                return challenge(&server, tx).await;
            }
            AuthOutcome::Rejected(reason) => {
                info!(device_id = %device_id, reason = %reason, "REGISTER rejected");
                let response = make_response(&tx.original, StatusCode::Forbidden);
                return tx.respond(response).await;
            }
        }
    }

    let expires = tx
        .original
        .expires_header()
        .and_then(|e| e.seconds().ok())
        .unwrap_or(server.cfg.register_expires);
    let source = source_of(&tx.original)?;
    let transport = match source.r#type {
        Some(rsip::transport::Transport::Tcp) => "tcp",
        _ => "udp",
    };

    if expires == 0 {
        info!(device_id = %device_id, "device unregistered");
        server
            .registry
            .change(&device_id, |entry| {
                entry.device.is_online = false;
            })
            .ok();
        server
            .store
            .device()
            .edit(&device_id, Box::new(|d| d.is_online = false))
            .await
            .ok();
    } else {
        let address = source.addr.to_string();
        server.registry.load_or_store(&device_id, || {
            let mut device = Device::new(&bz::unique_id(bz::ID_PREFIX_GB), &device_id);
            device.transport = transport.to_string();
            DeviceEntry::new(device)
        });
        server.registry.change(&device_id, |entry| {
            entry.source = Some(source.clone());
            entry.connection = tx.connection.clone();
            entry.device.transport = transport.to_string();
            entry.device.address = address.clone();
            entry.device.registered_at = Some(Utc::now());
            entry.device.expires = expires;
        })?;

        // the repository row is created on first sight of the device
        if server.store.device().get(&device_id).await.is_err() {
            let entry = server.registry.load(&device_id);
            if let Some(entry) = entry {
                server.store.device().add(&entry.device).await.ok();
            }
        } else {
            let address = source.addr.to_string();
            let transport = transport.to_string();
            server
                .store
                .device()
                .edit(
                    &device_id,
                    Box::new(move |d| {
                        d.address = address;
                        d.transport = transport;
                        d.expires = expires;
                        d.registered_at = Some(Utc::now());
                    }),
                )
                .await
                .ok();
        }
        info!(device_id = %device_id, source = %source, "device registered");
    }

    let mut response = make_response(&tx.original, StatusCode::OK);
    if let Ok(contact) = tx.original.contact_header() {
        response.headers.push(Header::Contact(contact.clone()));
    }
    response
        .headers
        .push(Header::Expires(expires.into()));
    response.headers.push(Header::Other(
        "Date".to_string(),
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
    ));
    tx.respond(response).await
}

async fn on_message(server: GbServerRef, tx: &mut Transaction) -> Result<()> {
    let body = body_text(&tx.original);
    let head = match xml::parse_head(&body) {
        Ok(head) => head,
        Err(e) => {
            warn!("undecodable MANSCDP body: {}", e);
            let response = make_response(&tx.original, StatusCode::BadRequest);
            return tx.respond(response).await;
        }
    };

    let outcome = match head.cmd_type.as_str() {
        xml::CMD_KEEPALIVE => on_keepalive(&server, tx, &body).await,
        xml::CMD_CATALOG => on_catalog(&server, &body).await,
        xml::CMD_ALARM => on_alarm(&server, &body),
        xml::CMD_RECORD_INFO => on_record_info(&server, &body),
        xml::CMD_DEVICE_INFO => on_device_info(&server, &body).await,
        other => {
            debug!(cmd = %other, "unhandled CmdType");
            Ok(())
        }
    };
    // the device retransmits on silence; answer 200 even when the body
    // could not be applied
    if let Err(e) = outcome {
        warn!(cmd = %head.cmd_type, "MESSAGE handling failed: {}", e);
    }

    let response = make_response(&tx.original, StatusCode::OK);
    tx.respond(response).await
}

async fn on_keepalive(server: &GbServerRef, tx: &mut Transaction, body: &str) -> Result<()> {
    let msg: xml::KeepaliveNotify =
        quick_xml::de::from_str(body.trim()).map_err(|e| crate::Error::Xml(e.to_string()))?;
    let source = source_of(&tx.original)?;
    let transport = match source.r#type {
        Some(rsip::transport::Transport::Tcp) => "tcp".to_string(),
        _ => "udp".to_string(),
    };
    let online = msg.is_ok();
    let address = source.addr.to_string();
    let connection = tx.connection.clone();

    let changed = server.registry.change(&msg.device_id, |entry| {
        entry.device.keepalive_at = Some(Utc::now());
        entry.device.is_online = online;
        entry.device.address = address.clone();
        entry.device.transport = transport.clone();
        entry.source = Some(source.clone());
        if connection.is_some() {
            entry.connection = connection.clone();
        }
    });
    if let Err(e) = changed {
        debug!(device_id = %msg.device_id, "keepalive from unknown device: {}", e);
    } else {
        server
            .store
            .device()
            .edit(
                &msg.device_id,
                Box::new(move |d| {
                    d.keepalive_at = Some(Utc::now());
                    d.is_online = online;
                }),
            )
            .await
            .ok();
    }
    Ok(())
}

async fn on_catalog(server: &GbServerRef, body: &str) -> Result<()> {
    let catalog: xml::CatalogResponse =
        quick_xml::de::from_str(body.trim()).map_err(|e| crate::Error::Xml(e.to_string()))?;
    let items = catalog
        .device_list
        .map(|list| list.items)
        .unwrap_or_default();
    debug!(
        device_id = %catalog.device_id,
        sn = catalog.sn,
        sum = catalog.sum_num,
        got = items.len(),
        "catalog chunk"
    );
    if let Some(batch) =
        server
            .catalog
            .ingest(&catalog.device_id, catalog.sn, catalog.sum_num, items)
    {
        server.save_channels(&catalog.device_id, batch).await?;
    }
    Ok(())
}

fn on_alarm(server: &GbServerRef, body: &str) -> Result<()> {
    let alarm: xml::AlarmNotify =
        quick_xml::de::from_str(body.trim()).map_err(|e| crate::Error::Xml(e.to_string()))?;
    info!(
        device_id = %alarm.device_id,
        priority = %alarm.alarm_priority,
        method = %alarm.alarm_method,
        "alarm notify"
    );
    // observers may come and go; no receiver is not an error
    server.alarm_tx.send(alarm).ok();
    Ok(())
}

fn on_record_info(server: &GbServerRef, body: &str) -> Result<()> {
    let response: xml::RecordInfoResponse =
        quick_xml::de::from_str(body.trim()).map_err(|e| crate::Error::Xml(e.to_string()))?;
    let items = response
        .record_list
        .map(|list| list.items)
        .unwrap_or_default();
    server.records.deliver(response.sn, response.sum_num, items);
    Ok(())
}

async fn on_device_info(server: &GbServerRef, body: &str) -> Result<()> {
    let info: xml::DeviceInfoResponse =
        quick_xml::de::from_str(body.trim()).map_err(|e| crate::Error::Xml(e.to_string()))?;
    let name = info.device_name.clone();
    let manufacturer = info.manufacturer.clone();
    let model = info.model.clone();
    let firmware = info.firmware.clone();
    server
        .registry
        .change(&info.device_id, |entry| {
            entry.device.name = name.clone();
            entry.device.manufacturer = manufacturer.clone();
            entry.device.model = model.clone();
            entry.device.firmware = firmware.clone();
        })
        .ok();
    let device_id = info.device_id.clone();
    server
        .store
        .device()
        .edit(
            &device_id,
            Box::new(move |d| {
                d.name = info.device_name;
                d.manufacturer = info.manufacturer;
                d.model = info.model;
                d.firmware = info.firmware;
            }),
        )
        .await
        .ok();
    Ok(())
}

async fn on_bye(server: GbServerRef, tx: &mut Transaction) -> Result<()> {
    if let Ok(call_id) = tx.original.call_id_header() {
        let call_id = call_id.to_string();
        if let Some(session) = server.session_by_call_id(&call_id) {
            info!(key = %session.key, "device sent BYE, dropping session");
            server.remove_session(&session.key);
        }
    }
    let response = make_response(&tx.original, StatusCode::OK);
    tx.respond(response).await
}
