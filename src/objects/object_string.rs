pub struct ObjectString {
    pub content: Box<str>,
    pub hash: u32,
}

impl ObjectString {
    pub fn new(content: &str) -> ObjectString {
        ObjectString {
            content: content.into(),
            hash: hash_str(content),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl PartialEq for ObjectString {
    fn eq(&self, other: &ObjectString) -> bool {
        self.hash == other.hash && self.content == other.content
    }
}

impl Eq for ObjectString {}

/// FNV-1a over the UTF-8 bytes.
pub fn hash_str(content: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in content.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_has_equal_hash() {
        let a = ObjectString::new("field");
        let b = ObjectString::new("field");
        assert!(a == b);
        assert_eq!(a.hash, b.hash);
        assert_ne!(hash_str("field"), hash_str("fields"));
    }

    #[test]
    fn empty_string_hash_is_offset_basis() {
        assert_eq!(hash_str(""), 2166136261);
        assert!(ObjectString::new("").is_empty());
    }
}
