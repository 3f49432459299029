use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::cname::CnameChain;
use crate::config::Strategy;
use crate::matcher::RuntimeConfig;
use crate::policy;
use crate::proto_utils::{cache_key, parse_question};
use crate::upstream::UpstreamClient;

/// The request pipeline. Cheap to clone; clones share the cache, the
/// upstream socket pool and the worker permits.
#[derive(Clone)]
pub struct Engine {
    config: Arc<ArcSwap<RuntimeConfig>>,
    cache: Arc<ResponseCache>,
    upstream: Arc<UpstreamClient>,
    workers: Arc<Semaphore>,
}

impl Engine {
    pub fn new(config: Arc<ArcSwap<RuntimeConfig>>, cache: Arc<ResponseCache>) -> Result<Self> {
        let workers = config.load().workers.max(1);
        Ok(Self {
            config,
            cache,
            upstream: Arc::new(UpstreamClient::new()?),
            workers: Arc::new(Semaphore::new(workers)),
        })
    }

    /// Handle one client packet and produce the reply bytes. Every exit
    /// path that can still reach the client answers; `Err` means the packet
    /// was too mangled to even echo a SERVFAIL at.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Result<Bytes> {
        // 工作槽：限制并发，permit 随请求结束（含 panic 展开）释放
        let _permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .context("worker pool closed")?;

        // Handlers keep one snapshot for the whole request so a mid-flight
        // reload cannot mix matchers from different generations.
        let cfg = self.config.load_full();
        let start = Instant::now();

        let mut qname_buf = [0u8; 256];
        let Some(q) = parse_question(packet, &mut qname_buf) else {
            debug!(client_ip = %peer.ip(), "unparseable or empty question");
            return servfail_for(packet);
        };
        let tx_id = q.tx_id;
        let qtype = RecordType::from(q.qtype);
        let qname = q.qname.to_string();

        if q.qd_count > 1 {
            // 多问题查询不进缓存也不改写，原样转发
            return match self
                .upstream
                .exchange(packet, &cfg.upstream, cfg.timeout)
                .await
            {
                Ok(raw) => Ok(raw),
                Err(err) => {
                    warn!(upstream = %cfg.upstream, error = %err, "opaque forward failed");
                    servfail_for(packet)
                }
            };
        }

        let key = cache_key(&q);
        if let Some(hit) = self.cache.lookup(&key, tx_id) {
            let bytes = encode_message(&hit)?;
            info!(
                event = "dns_response",
                upstream = "cache",
                qname = %qname,
                qtype = ?qtype,
                rcode = ?hit.response_code(),
                latency_ms = start.elapsed().as_millis() as u64,
                client_ip = %peer.ip(),
                cache = true,
                "cache hit"
            );
            return Ok(bytes);
        }

        let raw = match self
            .upstream
            .exchange(packet, &cfg.upstream, cfg.timeout)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(upstream = %cfg.upstream, qname = %qname, error = %err, "primary exchange failed");
                return servfail_for(packet);
            }
        };
        let resp = match Message::from_vec(&raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(upstream = %cfg.upstream, qname = %qname, error = %err, "unparseable upstream response");
                return servfail_for(packet);
            }
        };

        let chain = CnameChain::from_response(&resp);
        // The rule governing this question: direct match first, then the
        // first chain name carrying a rule.
        let rule = cfg
            .domains
            .rule_for(&qname)
            .or_else(|| chain.names().find_map(|name| cfg.domains.rule_for(name)));
        let has_address = resp
            .answers()
            .iter()
            .any(|r| matches!(r.record_type(), RecordType::A | RecordType::AAAA));
        let skip_fallback = rule
            .and_then(|r| r.no_record_no_fallback)
            .unwrap_or(cfg.no_record_no_fallback);

        let (outcome, source, final_msg, reply) = if !has_address && skip_fallback {
            let strip = rule
                .map(|r| r.strategy == Strategy::ReturnCdnA && r.strip_cname_when_no_record)
                .unwrap_or(false);
            if strip {
                let stripped = policy::strip_cnames(&resp, &qname);
                let bytes = encode_message(&stripped)?;
                ("stripped", cfg.upstream.clone(), stripped, bytes)
            } else {
                ("pass_through", cfg.upstream.clone(), resp, raw)
            }
        } else {
            let cdn_ips = policy::collect_cdn_ips(&resp, &chain, &cfg.domains, &cfg.cdn_ips);
            if cdn_ips.is_empty() {
                if let Some(fallback) = cfg.fallback.as_deref() {
                    match self.upstream.exchange(packet, fallback, cfg.timeout).await {
                        Ok(fb_raw) => match Message::from_vec(&fb_raw) {
                            Ok(fb_msg) => ("fallback", fallback.to_string(), fb_msg, fb_raw),
                            Err(err) => {
                                warn!(upstream = %fallback, qname = %qname, error = %err, "unparseable fallback response");
                                return servfail_for(packet);
                            }
                        },
                        Err(err) => {
                            warn!(upstream = %fallback, qname = %qname, error = %err, "fallback exchange failed");
                            return servfail_for(packet);
                        }
                    }
                } else {
                    ("pass_through", cfg.upstream.clone(), resp, raw)
                }
            } else {
                let req = match Message::from_vec(packet) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(qname = %qname, error = %err, "malformed request");
                        return servfail_for(packet);
                    }
                };
                let rewritten = policy::apply(&req, &resp, &cfg);
                let bytes = encode_message(&rewritten)?;
                ("rewritten", cfg.upstream.clone(), rewritten, bytes)
            }
        };

        self.cache.store(&key, &final_msg);
        info!(
            event = "dns_response",
            upstream = %source,
            qname = %qname,
            qtype = ?qtype,
            rcode = ?final_msg.response_code(),
            latency_ms = start.elapsed().as_millis() as u64,
            client_ip = %peer.ip(),
            cache = false,
            outcome = outcome,
            "answered"
        );
        Ok(reply)
    }
}

fn encode_message(msg: &Message) -> Result<Bytes> {
    let bytes = msg.to_vec().context("encode response")?;
    Ok(Bytes::from(bytes))
}

/// A SERVFAIL reply for `packet`: a proper question-echoing reply when the
/// packet parses, otherwise a bare header reusing the transaction id.
pub fn servfail_for(packet: &[u8]) -> Result<Bytes> {
    if let Ok(req) = Message::from_vec(packet) {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(req.op_code());
        msg.set_recursion_desired(req.recursion_desired());
        msg.set_recursion_available(true);
        msg.set_response_code(ResponseCode::ServFail);
        msg.add_queries(req.queries().to_vec());
        return encode_message(&msg);
    }
    if packet.len() >= 12 {
        let mut header = [0u8; 12];
        header[0] = packet[0];
        header[1] = packet[1];
        header[2] = 0x80 | (packet[2] & 0x79); // QR set, opcode + RD kept
        header[3] = 0x82; // RA set, rcode SERVFAIL
        return Ok(Bytes::copy_from_slice(&header));
    }
    bail!("packet too short for a reply")
}
