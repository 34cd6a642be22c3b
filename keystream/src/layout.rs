//! Key layout of a stream inside the store.
//!
//! Keys are built from typed elements with an order-preserving encoding, so
//! keys sharing a prefix stay contiguous and integer elements sort
//! numerically:
//!
//! ```text
//! ("keystream", namespace, "streams", topic)
//!   ├── "partitions" / {index} / <versionstamp>           message payloads
//!   ├── "consumer-groups" / {group}
//!   │     ├── "partitions" / {index} / "owner"            owning instance id
//!   │     ├── "partitions" / {index} / "cursor"           last consumed key
//!   │     └── "members" / {instance}                      registration counter
//!   └── "stream" / "signal" | "partitions"                change counter, partition count
//! ```

use keystream_store::{VERSIONSTAMP_LEN, Versionstamp};

const STRING_CODE: u8 = 0x02;
const U32_CODE: u8 = 0x15;
const VERSIONSTAMP_CODE: u8 = 0x33;

const ESCAPE: u8 = 0xff;

/// One component of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element<'a> {
    Str(&'a str),
    U32(u32),
}

impl Element<'_> {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Element::Str(s) => {
                out.push(STRING_CODE);
                for byte in s.as_bytes() {
                    out.push(*byte);
                    if *byte == 0 {
                        out.push(ESCAPE);
                    }
                }
                out.push(0);
            }
            Element::U32(n) => {
                out.push(U32_CODE);
                out.extend_from_slice(&n.to_be_bytes());
            }
        }
    }
}

/// A key prefix that scopes every key built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    #[must_use]
    pub fn new(elements: &[Element<'_>]) -> Self {
        let mut prefix = Vec::new();
        for element in elements {
            element.encode_into(&mut prefix);
        }
        Self { prefix }
    }

    /// Nested subspace extended by one element.
    #[must_use]
    pub fn sub(&self, element: Element<'_>) -> Subspace {
        Subspace {
            prefix: self.key(element),
        }
    }

    /// Key formed by this prefix followed by one element.
    #[must_use]
    pub fn key(&self, element: Element<'_>) -> Vec<u8> {
        let mut key = self.prefix.clone();
        element.encode_into(&mut key);
        key
    }

    pub fn bytes(&self) -> &[u8] {
        &self.prefix
    }

    /// `[begin, end)` covering every key strictly inside this subspace.
    #[must_use]
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xff);
        (begin, end)
    }

    /// Decode a key made of this prefix plus a single string element.
    #[must_use]
    pub fn unpack_str(&self, key: &[u8]) -> Option<String> {
        let rest = key.strip_prefix(self.prefix.as_slice())?;
        let (&code, mut rest) = rest.split_first()?;
        if code != STRING_CODE {
            return None;
        }

        let mut bytes = Vec::with_capacity(rest.len());
        loop {
            let (&byte, tail) = rest.split_first()?;
            rest = tail;
            if byte != 0 {
                bytes.push(byte);
                continue;
            }
            match rest.split_first() {
                Some((&ESCAPE, tail)) => {
                    bytes.push(0);
                    rest = tail;
                }
                _ if rest.is_empty() => break,
                _ => return None,
            }
        }
        String::from_utf8(bytes).ok()
    }
}

/// Every key used by one stream, rooted at `("keystream", namespace, "streams", topic)`.
#[derive(Debug, Clone)]
pub struct TopicLayout {
    topic: String,
    root: Subspace,
}

impl TopicLayout {
    #[must_use]
    pub fn new(namespace: &str, topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            root: Subspace::new(&[
                Element::Str("keystream"),
                Element::Str(namespace),
                Element::Str("streams"),
                Element::Str(topic),
            ]),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn root(&self) -> &Subspace {
        &self.root
    }

    /// Subspace holding a partition's messages.
    #[must_use]
    pub fn partition(&self, partition: u32) -> Subspace {
        self.root
            .sub(Element::Str("partitions"))
            .sub(Element::U32(partition))
    }

    /// Prefix that the store completes with a versionstamp when appending.
    ///
    /// Also the initial cursor of the partition: every message key sorts
    /// strictly after it.
    #[must_use]
    pub fn message_prefix(&self, partition: u32) -> Vec<u8> {
        let mut prefix = self.partition(partition).bytes().to_vec();
        prefix.push(VERSIONSTAMP_CODE);
        prefix
    }

    /// Exclusive upper bound of a partition's message keys.
    #[must_use]
    pub fn messages_end(&self, partition: u32) -> Vec<u8> {
        let mut end = self.partition(partition).bytes().to_vec();
        end.push(VERSIONSTAMP_CODE + 1);
        end
    }

    /// Versionstamp of a message key in `partition`, if it is one.
    #[must_use]
    pub fn message_stamp(&self, partition: u32, key: &[u8]) -> Option<Versionstamp> {
        let stamp = key.strip_prefix(self.message_prefix(partition).as_slice())?;
        if stamp.len() != VERSIONSTAMP_LEN {
            return None;
        }
        Versionstamp::from_bytes(stamp)
    }

    #[must_use]
    pub fn group(&self, group_id: &str) -> Subspace {
        self.root
            .sub(Element::Str("consumer-groups"))
            .sub(Element::Str(group_id))
    }

    fn group_partition(&self, group_id: &str, partition: u32) -> Subspace {
        self.group(group_id)
            .sub(Element::Str("partitions"))
            .sub(Element::U32(partition))
    }

    /// Instance id of the group member allowed to consume `partition`.
    #[must_use]
    pub fn owner_key(&self, group_id: &str, partition: u32) -> Vec<u8> {
        self.group_partition(group_id, partition)
            .key(Element::Str("owner"))
    }

    /// Last message key the group consumed from `partition`.
    #[must_use]
    pub fn cursor_key(&self, group_id: &str, partition: u32) -> Vec<u8> {
        self.group_partition(group_id, partition)
            .key(Element::Str("cursor"))
    }

    #[must_use]
    pub fn members(&self, group_id: &str) -> Subspace {
        self.group(group_id).sub(Element::Str("members"))
    }

    #[must_use]
    pub fn member_key(&self, group_id: &str, instance_id: &str) -> Vec<u8> {
        self.members(group_id).key(Element::Str(instance_id))
    }

    /// Change counter bumped by every append.
    #[must_use]
    pub fn signal_key(&self) -> Vec<u8> {
        self.root
            .sub(Element::Str("stream"))
            .key(Element::Str("signal"))
    }

    /// Partition count fixed when the stream is first opened.
    #[must_use]
    pub fn partition_count_key(&self) -> Vec<u8> {
        self.root
            .sub(Element::Str("stream"))
            .key(Element::Str("partitions"))
    }
}
