use std::str::from_utf8;

/// 仅解析 DNS 头部和第一个问题，用于缓存键和路由决策
/// 避免 hickory-proto Message 全量解析的分配开销
pub struct QuickQuery<'a> {
    pub tx_id: u16,
    pub qd_count: u16,
    /// 归一化后的问题域名（小写，无结尾点）
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
}

/// 缓存键：归一化域名 + 类型 + 类，两个等价请求产生相同的键
#[inline]
pub fn cache_key(q: &QuickQuery<'_>) -> String {
    format!("{}|{}|{}", q.qname, q.qtype, q.qclass)
}

/// Parse the header and first question of a DNS packet without a full decode.
/// `buf` receives the normalised (lower-cased, dot-joined) qname; 256 bytes
/// is enough for any legal name. Returns `None` for packets with no
/// question or that cannot be walked safely.
pub fn parse_question<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<QuickQuery<'a>> {
    if packet.len() < 12 {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let packet_len = packet.len();
    let mut pos = 12;
    let mut buf_pos = 0;

    // Walk the name, following at most a few compression pointers so a
    // malicious pointer loop cannot hang the parser.
    let mut jumped = false;
    let mut remaining_jumps = 5u8;
    let mut cursor = pos;

    loop {
        if cursor >= packet_len {
            return None;
        }
        let len = packet[cursor];

        if len == 0 {
            if !jumped {
                pos = cursor + 1;
            }
            break;
        }

        if (len & 0xC0) == 0xC0 {
            if packet_len < cursor + 2 {
                return None;
            }
            if !jumped {
                pos = cursor + 2;
                jumped = true;
            }
            let offset = (((len as u16) & 0x3F) << 8) | packet[cursor + 1] as u16;
            cursor = offset as usize;
            remaining_jumps -= 1;
            if remaining_jumps == 0 {
                return None;
            }
            continue;
        }

        let label_len = len as usize;
        cursor += 1;
        if packet_len < cursor + label_len {
            return None;
        }

        if buf_pos > 0 {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b'.';
            buf_pos += 1;
        }

        // Labels are ASCII or punycode in practice; lower-casing byte-wise
        // leaves any raw UTF-8 untouched.
        for &b in &packet[cursor..cursor + label_len] {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b.to_ascii_lowercase();
            buf_pos += 1;
        }

        cursor += label_len;
    }

    if packet_len < pos + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);

    let qname = from_utf8(&buf[..buf_pos]).ok()?;

    Some(QuickQuery {
        tx_id,
        qd_count,
        qname,
        qtype,
        qclass,
    })
}
