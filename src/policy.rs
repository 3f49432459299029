use std::net::{IpAddr, Ipv4Addr};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::cname::CnameChain;
use crate::config::Strategy;
use crate::matcher::{normalize_name, CidrSet, DomainSet, RuntimeConfig};

const DEFAULT_CDN_TTL: u32 = 60;

/// CDN addresses present in the answer: A records whose owner is in the
/// CNAME chain or directly rule-matched, and whose address lies inside a
/// configured prefix.
pub fn collect_cdn_ips(
    resp: &Message,
    chain: &CnameChain,
    domains: &DomainSet,
    cdn_ips: &CidrSet,
) -> Vec<Ipv4Addr> {
    resp.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => {
                let owner = normalize_name(&record.name().to_utf8());
                let qualified = chain.contains(&owner) || domains.matches(&owner);
                if qualified && cdn_ips.contains(IpAddr::V4(a.0)) {
                    Some(a.0)
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect()
}

/// Keep every CNAME; keep address records only when the owner is chain- or
/// rule-qualified and the address is CDN-owned. Record order among kept
/// records is the original order.
pub fn filter_non_cdn(
    resp: &Message,
    chain: &CnameChain,
    domains: &DomainSet,
    cdn_ips: &CidrSet,
) -> Message {
    let mut out = resp.clone();
    let answers = out.take_answers();
    let kept: Vec<Record> = answers
        .into_iter()
        .filter(|record| match record.data() {
            Some(RData::CNAME(_)) => true,
            Some(RData::A(a)) => {
                keep_address(record.name(), IpAddr::V4(a.0), chain, domains, cdn_ips)
            }
            Some(RData::AAAA(aaaa)) => {
                keep_address(record.name(), IpAddr::V6(aaaa.0), chain, domains, cdn_ips)
            }
            _ => false,
        })
        .collect();
    out.insert_answers(kept);
    out
}

fn keep_address(
    owner: &Name,
    addr: IpAddr,
    chain: &CnameChain,
    domains: &DomainSet,
    cdn_ips: &CidrSet,
) -> bool {
    let owner = normalize_name(&owner.to_utf8());
    let qualified = chain.contains(&owner) || domains.matches(&owner);
    qualified && cdn_ips.contains(addr)
}

/// Synthesise a reply carrying one A record per CDN address, owned by the
/// question name. Non-A questions get an empty answer section.
pub fn return_cdn_a(req: &Message, cdn_ips: &[Ipv4Addr], ttl: u32) -> Message {
    let mut resp = reply_to(req);
    let Some(question) = req.queries().first() else {
        return resp;
    };
    if question.query_type() != RecordType::A {
        return resp;
    }

    let owner = question.name().clone();
    let ttl = if ttl == 0 { DEFAULT_CDN_TTL } else { ttl };
    for ip in cdn_ips {
        resp.add_answer(Record::from_rdata(owner.clone(), ttl, RData::A(A(*ip))));
    }
    resp
}

/// Remove the CNAME records reachable from `target_domain`. The trace stops
/// on a missing link or a revisit, so cyclic chains terminate.
pub fn strip_cnames(resp: &Message, target_domain: &str) -> Message {
    let chain = CnameChain::from_response(resp);
    let mut strip: FxHashSet<String> = chain.trace(target_domain).into_iter().collect();
    strip.insert(normalize_name(target_domain));

    let mut out = resp.clone();
    let answers = out.take_answers();
    let kept: Vec<Record> = answers
        .into_iter()
        .filter(|record| {
            if !matches!(record.data(), Some(RData::CNAME(_))) {
                return true;
            }
            !strip.contains(&normalize_name(&record.name().to_utf8()))
        })
        .collect();
    out.insert_answers(kept);
    out
}

/// The policy decision for a response to a known single question: pick the
/// strategy (question rule first, then any chain name carrying one), bail
/// out unchanged when no strategy or no CDN address applies, otherwise
/// rewrite.
pub fn apply(req: &Message, resp: &Message, rt: &RuntimeConfig) -> Message {
    let Some(question) = req.queries().first() else {
        return resp.clone();
    };
    let qname = normalize_name(&question.name().to_utf8());
    let chain = CnameChain::from_response(resp);

    let (strategy, policy_domain) = effective_strategy(&qname, &chain, &rt.domains);
    if strategy == Strategy::None {
        return resp.clone();
    }

    let cdn_ips = collect_cdn_ips(resp, &chain, &rt.domains, &rt.cdn_ips);
    if cdn_ips.is_empty() {
        debug!(qname = %qname, "no cdn address in answer, passing through");
        return resp.clone();
    }

    match strategy {
        Strategy::FilterNonCdn => filter_non_cdn(resp, &chain, &rt.domains, &rt.cdn_ips),
        Strategy::ReturnCdnA => {
            let ttl = rt
                .domains
                .rule_for(&qname)
                .or_else(|| rt.domains.rule_for(&policy_domain))
                .map(|rule| rule.ttl)
                .unwrap_or(0);
            return_cdn_a(req, &cdn_ips, ttl)
        }
        Strategy::None => resp.clone(),
    }
}

/// The question name's rule governs when it carries a real strategy;
/// otherwise the first chain name with one is adopted as policy-domain.
pub fn effective_strategy(
    qname: &str,
    chain: &CnameChain,
    domains: &DomainSet,
) -> (Strategy, String) {
    if let Some(rule) = domains.rule_for(qname) {
        if rule.strategy != Strategy::None {
            return (rule.strategy, qname.to_string());
        }
    }
    for name in chain.names() {
        if let Some(rule) = domains.rule_for(name) {
            if rule.strategy != Strategy::None {
                debug!(policy_domain = %name, "strategy adopted from cname chain");
                return (rule.strategy, name.to_string());
            }
        }
    }
    (Strategy::None, qname.to_string())
}

fn reply_to(req: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(ResponseCode::NoError);
    msg.add_queries(req.queries().to_vec());
    msg
}
