use std::borrow::Cow;

/// Strip the trailing padding characters of a UID.
pub fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with(['\0', ' ']) {
        Cow::Owned(uid.trim_end_matches(['\0', ' ']).to_string())
    } else {
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_padding() {
        assert_eq!(trim_uid("1.2.840.10008.1.1\0".into()), "1.2.840.10008.1.1");
        assert_eq!(trim_uid("1.2.840.10008.1.1".into()), "1.2.840.10008.1.1");
    }
}
