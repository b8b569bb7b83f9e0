//! MQI client transport over a server-connection channel.
//!
//! Every MQI call blocks, so each one runs on the blocking pool against a
//! connection opened with a shared handle. Gets and puts are made under
//! syncpoint; message properties travel through message handles.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use mqi::sys as mq;
use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    reason, GetOutcome, MqConfig, MqConnector, MqError, MqMessage, MqSession, CORREL_ID_LENGTH,
};
use crate::Header;

const INITIAL_BUFFER: usize = 64 * 1024;
const PROPERTY_NAME_BUFFER: usize = 4096;
const UTF8_CCSID: mq::MQLONG = 1208;

/// Property folders owned by MQ or JMS rather than the application.
const RESERVED_PREFIXES: &[&str] = &["jms", "mcd.", "mq", "usr.jms"];

// SAFETY (for every use): only instantiated with MQI structures, which are
// plain C data made of integers, fixed arrays and raw pointers.
fn blank<T: Copy>() -> T {
    unsafe { std::mem::zeroed() }
}

/// Writes `value` into a fixed-length MQCHAR field, blank padded.
fn fill(field: &mut [mq::MQCHAR], value: &str) {
    let bytes = value.as_bytes();
    for (i, slot) in field.iter_mut().enumerate() {
        *slot = bytes.get(i).copied().unwrap_or(b' ') as mq::MQCHAR;
    }
}

fn read_chars(field: &[mq::MQCHAR]) -> String {
    let text: String = field.iter().map(|c| *c as u8 as char).collect();
    text.trim_end_matches([' ', '\0']).to_string()
}

fn check(cc: mq::MQLONG, rc: mq::MQLONG, object: &str) -> Result<(), MqError> {
    if cc == mq::MQCC_FAILED as mq::MQLONG {
        return Err(MqError::from_reason(rc, object));
    }
    Ok(())
}

/// `MQCI_NONE` is all zeroes and shorter IDs are zero padded.
fn correlation_id(raw: &[u8]) -> Option<Bytes> {
    let end = raw.iter().rposition(|b| *b != 0)? + 1;
    Some(Bytes::copy_from_slice(&raw[..end]))
}

/// `PutDate` is `YYYYMMDD`, `PutTime` is `HHMMSSTH` in GMT.
fn put_time(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let seconds =
        NaiveDateTime::parse_from_str(&format!("{date}{}", time.get(..6)?), "%Y%m%d%H%M%S").ok()?;
    let hundredths: i64 = time.get(6..8)?.parse().ok()?;
    Some((seconds + chrono::Duration::milliseconds(hundredths * 10)).and_utc())
}

fn is_user_property(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !RESERVED_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Renders a typed property value as the bytes carried in a Kafka header.
fn property_bytes(kind: mq::MQLONG, raw: &[u8]) -> Bytes {
    fn array<const N: usize>(raw: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        let n = raw.len().min(N);
        out[..n].copy_from_slice(&raw[..n]);
        out
    }
    let text = if kind == mq::MQTYPE_BOOLEAN as mq::MQLONG {
        (i32::from_ne_bytes(array(raw)) != 0).to_string()
    } else if kind == mq::MQTYPE_INT8 as mq::MQLONG {
        i8::from_ne_bytes(array(raw)).to_string()
    } else if kind == mq::MQTYPE_INT16 as mq::MQLONG {
        i16::from_ne_bytes(array(raw)).to_string()
    } else if kind == mq::MQTYPE_INT32 as mq::MQLONG {
        i32::from_ne_bytes(array(raw)).to_string()
    } else if kind == mq::MQTYPE_INT64 as mq::MQLONG {
        i64::from_ne_bytes(array(raw)).to_string()
    } else if kind == mq::MQTYPE_FLOAT32 as mq::MQLONG {
        f32::from_ne_bytes(array(raw)).to_string()
    } else if kind == mq::MQTYPE_FLOAT64 as mq::MQLONG {
        f64::from_ne_bytes(array(raw)).to_string()
    } else {
        return Bytes::copy_from_slice(raw);
    };
    Bytes::from(text)
}

fn message_descriptor() -> mq::MQMD {
    let mut md: mq::MQMD = blank();
    fill(&mut md.StrucId, "MD  ");
    md.Version = mq::MQMD_VERSION_2 as mq::MQLONG;
    md.MsgType = mq::MQMT_DATAGRAM as mq::MQLONG;
    md.Expiry = mq::MQEI_UNLIMITED as mq::MQLONG;
    md.Priority = mq::MQPRI_PRIORITY_AS_Q_DEF as mq::MQLONG;
    md.Persistence = mq::MQPER_PERSISTENCE_AS_Q_DEF as mq::MQLONG;
    fill(&mut md.Format, "");
    md
}

struct Connection {
    hconn: mq::MQHCONN,
    queue_manager: String,
    max_message_bytes: usize,
    inputs: HashMap<String, mq::MQHOBJ>,
    outputs: HashMap<String, mq::MQHOBJ>,
    buffer: Vec<u8>,
}

impl Connection {
    fn open(config: &MqConfig) -> Result<Self, MqError> {
        let connection_names = config
            .connection_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut cd: mq::MQCD = blank();
        cd.Version = mq::MQCD_VERSION_11 as mq::MQLONG;
        cd.ChannelType = mq::MQCHT_CLNTCONN as mq::MQLONG;
        cd.TransportType = mq::MQXPT_TCP as mq::MQLONG;
        cd.MaxMsgLength = config.max_message_bytes as mq::MQLONG;
        cd.HeartbeatInterval = 300;
        cd.KeepAliveInterval = mq::MQKAI_AUTO as mq::MQLONG;
        cd.SharingConversations = 10;
        fill(&mut cd.ChannelName, &config.channel);
        fill(&mut cd.ConnectionName, &connection_names);
        fill(&mut cd.SSLCipherSpec, config.ssl_cipher_spec.as_deref().unwrap_or(""));

        let mut repo_password = config.key_repository_password.clone().unwrap_or_default();
        let mut sco: mq::MQSCO = blank();
        fill(&mut sco.StrucId, "SCO ");
        sco.Version = mq::MQSCO_VERSION_5 as mq::MQLONG;
        sco.EncryptionPolicySuiteB = [
            mq::MQ_SUITE_B_NONE as mq::MQLONG,
            mq::MQ_SUITE_B_NOT_AVAILABLE as mq::MQLONG,
            mq::MQ_SUITE_B_NOT_AVAILABLE as mq::MQLONG,
            mq::MQ_SUITE_B_NOT_AVAILABLE as mq::MQLONG,
        ];
        fill(&mut sco.KeyRepository, config.key_repository.as_deref().unwrap_or(""));
        if !repo_password.is_empty() {
            sco.Version = mq::MQSCO_VERSION_6 as mq::MQLONG;
            sco.KeyRepoPasswordPtr = repo_password.as_mut_ptr().cast();
            sco.KeyRepoPasswordLength = repo_password.len() as mq::MQLONG;
        }

        let mut user = config.user.clone().unwrap_or_default();
        let mut password = config.password.clone().unwrap_or_default();
        let mut csp: mq::MQCSP = blank();
        fill(&mut csp.StrucId, "CSP ");
        csp.Version = mq::MQCSP_VERSION_1 as mq::MQLONG;
        csp.AuthenticationType = mq::MQCSP_AUTH_USER_ID_AND_PWD as mq::MQLONG;
        csp.CSPUserIdPtr = user.as_mut_ptr().cast();
        csp.CSPUserIdLength = user.len() as mq::MQLONG;
        csp.CSPPasswordPtr = password.as_mut_ptr().cast();
        csp.CSPPasswordLength = password.len() as mq::MQLONG;

        let mut cno: mq::MQCNO = blank();
        fill(&mut cno.StrucId, "CNO ");
        cno.Version = mq::MQCNO_VERSION_5 as mq::MQLONG;
        cno.Options = mq::MQCNO_CLIENT_BINDING as mq::MQLONG
            | mq::MQCNO_HANDLE_SHARE_BLOCK as mq::MQLONG;
        cno.ClientConnPtr = ptr::addr_of_mut!(cd).cast();
        if config.ssl_cipher_spec.is_some() || config.key_repository.is_some() {
            cno.SSLConfigPtr = ptr::addr_of_mut!(sco).cast();
        }
        if config.user.is_some() {
            cno.SecurityParmsPtr = ptr::addr_of_mut!(csp).cast();
        }

        let mut name = [0 as mq::MQCHAR; 48];
        fill(&mut name, &config.queue_manager);
        let mut hconn: mq::MQHCONN = mq::MQHC_UNUSABLE_HCONN as mq::MQHCONN;
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe {
            mq::MQCONNX(
                name.as_mut_ptr(),
                ptr::addr_of_mut!(cno).cast(),
                &mut hconn,
                &mut cc,
                &mut rc,
            )
        };
        check(cc, rc, &config.queue_manager)?;

        Ok(Self {
            hconn,
            queue_manager: config.queue_manager.clone(),
            max_message_bytes: config.max_message_bytes,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            buffer: vec![0; INITIAL_BUFFER.min(config.max_message_bytes.max(1))],
        })
    }

    /// Opens `queue` once per direction and keeps the handle for the session.
    fn object(&mut self, queue: &str, output: bool) -> Result<mq::MQHOBJ, MqError> {
        let hconn = self.hconn;
        let handles = if output {
            &mut self.outputs
        } else {
            &mut self.inputs
        };
        if let Some(hobj) = handles.get(queue) {
            return Ok(*hobj);
        }

        let mut od: mq::MQOD = blank();
        fill(&mut od.StrucId, "OD  ");
        od.Version = mq::MQOD_VERSION_1 as mq::MQLONG;
        od.ObjectType = mq::MQOT_Q as mq::MQLONG;
        fill(&mut od.ObjectName, queue);
        fill(&mut od.ObjectQMgrName, "");
        let options = if output {
            mq::MQOO_OUTPUT as mq::MQLONG
        } else {
            mq::MQOO_INPUT_AS_Q_DEF as mq::MQLONG
        } | mq::MQOO_FAIL_IF_QUIESCING as mq::MQLONG;

        let mut hobj: mq::MQHOBJ = mq::MQHO_UNUSABLE_HOBJ as mq::MQHOBJ;
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe {
            mq::MQOPEN(
                hconn,
                ptr::addr_of_mut!(od).cast(),
                options,
                &mut hobj,
                &mut cc,
                &mut rc,
            )
        };
        check(cc, rc, queue)?;
        debug!("Opened {} for {}", queue, if output { "output" } else { "input" });
        handles.insert(queue.to_string(), hobj);
        Ok(hobj)
    }

    fn create_handle(&self) -> Result<mq::MQHMSG, MqError> {
        let mut cmho: mq::MQCMHO = blank();
        fill(&mut cmho.StrucId, "CMHO");
        cmho.Version = mq::MQCMHO_VERSION_1 as mq::MQLONG;
        cmho.Options = mq::MQCMHO_DEFAULT_VALIDATION as mq::MQLONG;
        let mut hmsg: mq::MQHMSG = mq::MQHM_UNUSABLE_HMSG as mq::MQHMSG;
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe {
            mq::MQCRTMH(
                self.hconn,
                ptr::addr_of_mut!(cmho).cast(),
                &mut hmsg,
                &mut cc,
                &mut rc,
            )
        };
        check(cc, rc, &self.queue_manager)?;
        Ok(hmsg)
    }

    fn delete_handle(&self, mut hmsg: mq::MQHMSG) {
        let mut dmho: mq::MQDMHO = blank();
        fill(&mut dmho.StrucId, "DMHO");
        dmho.Version = mq::MQDMHO_VERSION_1 as mq::MQLONG;
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe {
            mq::MQDLTMH(
                self.hconn,
                &mut hmsg,
                ptr::addr_of_mut!(dmho).cast(),
                &mut cc,
                &mut rc,
            )
        };
        if cc == mq::MQCC_FAILED as mq::MQLONG {
            debug!("Deleting message handle failed with MQRC {}", rc);
        }
    }

    fn get(&mut self, queue: &str, wait: Duration) -> Result<GetOutcome, MqError> {
        let hobj = self.object(queue, false)?;
        let hmsg = self.create_handle()?;
        let result = self.get_with_handle(queue, hobj, hmsg, wait);
        self.delete_handle(hmsg);
        result
    }

    fn get_with_handle(
        &mut self,
        queue: &str,
        hobj: mq::MQHOBJ,
        hmsg: mq::MQHMSG,
        wait: Duration,
    ) -> Result<GetOutcome, MqError> {
        loop {
            let mut md = message_descriptor();
            let mut gmo: mq::MQGMO = blank();
            fill(&mut gmo.StrucId, "GMO ");
            gmo.Version = mq::MQGMO_VERSION_4 as mq::MQLONG;
            gmo.Options = mq::MQGMO_SYNCPOINT as mq::MQLONG
                | mq::MQGMO_WAIT as mq::MQLONG
                | mq::MQGMO_FAIL_IF_QUIESCING as mq::MQLONG
                | mq::MQGMO_PROPERTIES_IN_HANDLE as mq::MQLONG;
            gmo.WaitInterval = wait.as_millis().min(i32::MAX as u128) as mq::MQLONG;
            gmo.MatchOptions = mq::MQMO_NONE as mq::MQLONG;
            gmo.MsgHandle = hmsg;

            let mut data_length: mq::MQLONG = 0;
            let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
            unsafe {
                mq::MQGET(
                    self.hconn,
                    hobj,
                    ptr::addr_of_mut!(md).cast(),
                    ptr::addr_of_mut!(gmo).cast(),
                    self.buffer.len() as mq::MQLONG,
                    self.buffer.as_mut_ptr().cast(),
                    &mut data_length,
                    &mut cc,
                    &mut rc,
                )
            };
            if cc == mq::MQCC_FAILED as mq::MQLONG {
                match rc {
                    reason::NO_MSG_AVAILABLE => return Ok(GetOutcome::Empty),
                    reason::TRUNCATED_MSG_FAILED => {
                        self.buffer.resize(data_length.max(0) as usize, 0);
                        continue;
                    }
                    _ => return Err(MqError::from_reason(rc, queue)),
                }
            }

            let length = (data_length.max(0) as usize).min(self.buffer.len());
            return Ok(GetOutcome::Message(MqMessage {
                message_id: Bytes::copy_from_slice(&md.MsgId),
                correlation_id: correlation_id(&md.CorrelId),
                properties: self.properties(hmsg)?,
                payload: Bytes::copy_from_slice(&self.buffer[..length]),
                backout_count: md.BackoutCount.max(0) as u32,
                put_time: put_time(&read_chars(&md.PutDate), &read_chars(&md.PutTime)),
            }));
        }
    }

    fn properties(&self, hmsg: mq::MQHMSG) -> Result<Vec<Header>, MqError> {
        let mut headers = Vec::new();
        let mut name_buffer = vec![0u8; PROPERTY_NAME_BUFFER];
        let mut value_buffer = vec![0u8; INITIAL_BUFFER];
        let mut wildcard = *b"%";
        let mut cursor = mq::MQIMPO_INQ_FIRST as mq::MQLONG;

        loop {
            let mut impo: mq::MQIMPO = blank();
            fill(&mut impo.StrucId, "IMPO");
            impo.Version = mq::MQIMPO_VERSION_1 as mq::MQLONG;
            impo.Options = cursor | mq::MQIMPO_CONVERT_VALUE as mq::MQLONG;
            impo.RequestedCCSID = UTF8_CCSID;
            impo.ReturnedName.VSPtr = name_buffer.as_mut_ptr().cast();
            impo.ReturnedName.VSBufSize = name_buffer.len() as mq::MQLONG;
            impo.ReturnedName.VSCCSID = UTF8_CCSID;

            let mut name: mq::MQCHARV = blank();
            name.VSPtr = wildcard.as_mut_ptr().cast();
            name.VSLength = wildcard.len() as mq::MQLONG;
            name.VSCCSID = UTF8_CCSID;

            let mut pd: mq::MQPD = blank();
            fill(&mut pd.StrucId, "PD  ");
            pd.Version = mq::MQPD_VERSION_1 as mq::MQLONG;

            let mut kind: mq::MQLONG = mq::MQTYPE_AS_SET as mq::MQLONG;
            let mut data_length: mq::MQLONG = 0;
            let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
            unsafe {
                mq::MQINQMP(
                    self.hconn,
                    hmsg,
                    ptr::addr_of_mut!(impo).cast(),
                    ptr::addr_of_mut!(name).cast(),
                    ptr::addr_of_mut!(pd).cast(),
                    &mut kind,
                    value_buffer.len() as mq::MQLONG,
                    value_buffer.as_mut_ptr().cast(),
                    &mut data_length,
                    &mut cc,
                    &mut rc,
                )
            };
            if cc == mq::MQCC_FAILED as mq::MQLONG {
                match rc {
                    reason::PROPERTY_NOT_AVAILABLE => break,
                    reason::PROPERTY_VALUE_TOO_BIG => {
                        value_buffer.resize(data_length.max(0) as usize, 0);
                        cursor = mq::MQIMPO_INQ_PROP_UNDER_CURSOR as mq::MQLONG;
                        continue;
                    }
                    _ => return Err(MqError::from_reason(rc, &self.queue_manager)),
                }
            }
            cursor = mq::MQIMPO_INQ_NEXT as mq::MQLONG;

            let name_length = (impo.ReturnedName.VSLength.max(0) as usize).min(name_buffer.len());
            let name = String::from_utf8_lossy(&name_buffer[..name_length]).into_owned();
            if !is_user_property(&name) {
                continue;
            }
            let value_length = (data_length.max(0) as usize).min(value_buffer.len());
            headers.push(Header::new(name, property_bytes(kind, &value_buffer[..value_length])));
        }
        Ok(headers)
    }

    fn set_properties(&self, hmsg: mq::MQHMSG, headers: &[Header]) -> Result<(), MqError> {
        for header in headers {
            let mut smpo: mq::MQSMPO = blank();
            fill(&mut smpo.StrucId, "SMPO");
            smpo.Version = mq::MQSMPO_VERSION_1 as mq::MQLONG;
            smpo.Options = mq::MQSMPO_APPEND_PROPERTY as mq::MQLONG;
            smpo.ValueCCSID = UTF8_CCSID;

            let mut name_bytes = header.name.clone().into_bytes();
            let mut name: mq::MQCHARV = blank();
            name.VSPtr = name_bytes.as_mut_ptr().cast();
            name.VSLength = name_bytes.len() as mq::MQLONG;
            name.VSCCSID = UTF8_CCSID;

            let mut pd: mq::MQPD = blank();
            fill(&mut pd.StrucId, "PD  ");
            pd.Version = mq::MQPD_VERSION_1 as mq::MQLONG;
            pd.Support = mq::MQPD_SUPPORT_OPTIONAL as mq::MQLONG;
            pd.CopyOptions = mq::MQCOPY_DEFAULT as mq::MQLONG;

            let kind = if std::str::from_utf8(&header.value).is_ok() {
                mq::MQTYPE_STRING as mq::MQLONG
            } else {
                mq::MQTYPE_BYTE_STRING as mq::MQLONG
            };
            let mut value = header.value.to_vec();
            let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
            unsafe {
                mq::MQSETMP(
                    self.hconn,
                    hmsg,
                    ptr::addr_of_mut!(smpo).cast(),
                    ptr::addr_of_mut!(name).cast(),
                    ptr::addr_of_mut!(pd).cast(),
                    kind,
                    value.len() as mq::MQLONG,
                    value.as_mut_ptr().cast(),
                    &mut cc,
                    &mut rc,
                )
            };
            check(cc, rc, &header.name)?;
        }
        Ok(())
    }

    fn put(&mut self, queue: &str, message: &MqMessage) -> Result<(), MqError> {
        if message.size() > self.max_message_bytes {
            return Err(MqError::MessageTooLarge {
                size: message.size(),
                max: self.max_message_bytes,
            });
        }
        let hobj = self.object(queue, true)?;
        let hmsg = self.create_handle()?;
        let result = self
            .set_properties(hmsg, &message.properties)
            .and_then(|()| self.put_with_handle(queue, hobj, hmsg, message));
        self.delete_handle(hmsg);
        result
    }

    fn put_with_handle(
        &self,
        queue: &str,
        hobj: mq::MQHOBJ,
        hmsg: mq::MQHMSG,
        message: &MqMessage,
    ) -> Result<(), MqError> {
        let mut md = message_descriptor();
        if let Some(correl) = &message.correlation_id {
            if correl.len() > CORREL_ID_LENGTH {
                return Err(MqError::MessageTooLarge {
                    size: correl.len(),
                    max: CORREL_ID_LENGTH,
                });
            }
            md.CorrelId[..correl.len()].copy_from_slice(correl);
        }

        let mut pmo: mq::MQPMO = blank();
        fill(&mut pmo.StrucId, "PMO ");
        pmo.Version = mq::MQPMO_VERSION_3 as mq::MQLONG;
        pmo.Options = mq::MQPMO_SYNCPOINT as mq::MQLONG
            | mq::MQPMO_NEW_MSG_ID as mq::MQLONG
            | mq::MQPMO_FAIL_IF_QUIESCING as mq::MQLONG;
        pmo.OriginalMsgHandle = hmsg;

        let mut payload = message.payload.to_vec();
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe {
            mq::MQPUT(
                self.hconn,
                hobj,
                ptr::addr_of_mut!(md).cast(),
                ptr::addr_of_mut!(pmo).cast(),
                payload.len() as mq::MQLONG,
                payload.as_mut_ptr().cast(),
                &mut cc,
                &mut rc,
            )
        };
        check(cc, rc, queue)
    }

    fn commit(&mut self) -> Result<(), MqError> {
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe { mq::MQCMIT(self.hconn, &mut cc, &mut rc) };
        check(cc, rc, &self.queue_manager)
    }

    fn backout(&mut self) -> Result<(), MqError> {
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe { mq::MQBACK(self.hconn, &mut cc, &mut rc) };
        check(cc, rc, &self.queue_manager)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.backout() {
            debug!("Backout on disconnect failed: {}", e);
        }
        let hconn = self.hconn;
        for (_, mut hobj) in self.inputs.drain().chain(self.outputs.drain()) {
            let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
            unsafe { mq::MQCLOSE(hconn, &mut hobj, mq::MQCO_NONE as mq::MQLONG, &mut cc, &mut rc) };
        }
        let (mut cc, mut rc): (mq::MQLONG, mq::MQLONG) = (0, 0);
        unsafe { mq::MQDISC(&mut self.hconn, &mut cc, &mut rc) };
        if cc == mq::MQCC_FAILED as mq::MQLONG {
            debug!("Disconnect from {} failed with MQRC {}", self.queue_manager, rc);
        }
    }
}

async fn blocking<T, F>(call: F) -> Result<T, MqError>
where
    F: FnOnce() -> Result<T, MqError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| MqError::ConnectionLost(format!("MQI call did not complete: {e}")))?
}

struct ClientSession {
    connection: Arc<Mutex<Connection>>,
    in_transaction: bool,
}

impl ClientSession {
    async fn call<T, F>(&self, call: F) -> Result<T, MqError>
    where
        F: FnOnce(&mut Connection) -> Result<T, MqError> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        blocking(move || {
            let mut connection = connection.lock().unwrap_or_else(PoisonError::into_inner);
            call(&mut connection)
        })
        .await
    }
}

#[async_trait]
impl MqSession for ClientSession {
    async fn get_next(&mut self, queue: &str, wait: Duration) -> Result<GetOutcome, MqError> {
        let queue = queue.to_string();
        let outcome = self.call(move |c| c.get(&queue, wait)).await?;
        if let GetOutcome::Message(_) = outcome {
            self.in_transaction = true;
        }
        Ok(outcome)
    }

    async fn put(&mut self, queue: &str, message: MqMessage) -> Result<(), MqError> {
        let queue = queue.to_string();
        self.call(move |c| c.put(&queue, &message)).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), MqError> {
        self.call(Connection::commit).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn backout(&mut self) -> Result<(), MqError> {
        let result = self.call(Connection::backout).await;
        self.in_transaction = false;
        result
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Connector for `mq.transport = client`, linked against the MQ client library.
pub struct ClientTransportConnector;

#[async_trait]
impl MqConnector for ClientTransportConnector {
    async fn connect(&self, config: &MqConfig) -> Result<Box<dyn MqSession>, MqError> {
        if config.connection_names.is_empty() {
            return Err(MqError::Connection(
                "connection name list is empty".to_string(),
            ));
        }
        info!(
            "Connecting to queue manager {} via channel {} at {:?}",
            config.queue_manager,
            config.channel,
            config
                .connection_names
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );
        let config = config.clone();
        let connection = blocking(move || Connection::open(&config)).await?;
        info!("Connected to queue manager {}", connection.queue_manager);

        Ok(Box::new(ClientSession {
            connection: Arc::new(Mutex::new(connection)),
            in_transaction: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_drops_padding() {
        let mut raw = [0u8; CORREL_ID_LENGTH];
        assert_eq!(correlation_id(&raw), None);

        raw[..6].copy_from_slice(b"abc123");
        assert_eq!(correlation_id(&raw), Some(Bytes::from("abc123")));
    }

    #[test]
    fn test_put_time_parsing() {
        let time = put_time("20260131", "23595912").unwrap();
        assert_eq!(time.to_rfc3339(), "2026-01-31T23:59:59.120+00:00");
        assert!(put_time("", "").is_none());
    }

    #[test]
    fn test_fixed_fields_round_trip() {
        let mut field = [0 as mq::MQCHAR; 8];
        fill(&mut field, "QM1");
        assert_eq!(field[3] as u8, b' ');
        assert_eq!(read_chars(&field), "QM1");
    }

    #[test]
    fn test_user_properties() {
        assert!(is_user_property("customer_id"));
        assert!(!is_user_property("JMSCorrelationID"));
        assert!(!is_user_property("mcd.Msd"));
        assert!(!is_user_property("mq.correlation.id"));
    }

    #[test]
    fn test_property_rendering() {
        let value = property_bytes(mq::MQTYPE_INT32 as mq::MQLONG, &42i32.to_ne_bytes());
        assert_eq!(value, Bytes::from("42"));
        let value = property_bytes(mq::MQTYPE_BYTE_STRING as mq::MQLONG, &[0, 255]);
        assert_eq!(value, Bytes::from_static(&[0, 255]));
    }
}
