use warden::http::encoding::{negotiate, parse_acceptable_encodings};
use warden::Encoding;

#[test]
fn test_preferred_encoding_wins_when_acceptable() {
    let acceptable = parse_acceptable_encodings(Some("gzip, deflate, identity"));
    let picked = negotiate(acceptable, &[Encoding::Gzip]);
    assert_eq!(picked, Some(Encoding::Gzip));
}

#[test]
fn test_empty_acceptable_set_has_no_pick() {
    // Everything listed with q=0: negotiation must fail, the daemon answers
    // 406 in that case
    let acceptable = parse_acceptable_encodings(Some("gzip;q=0, deflate;q=0, identity;q=0"));
    assert_eq!(acceptable, 0);
    assert_eq!(negotiate(acceptable, &[Encoding::Gzip]), None);
}

#[test]
fn test_fallback_to_any_acceptable_encoding() {
    // Preferred gzip is not acceptable, but deflate is: pick deflate instead
    // of failing
    let acceptable = parse_acceptable_encodings(Some("deflate"));
    let picked = negotiate(acceptable, &[Encoding::Gzip]);
    assert_eq!(picked, Some(Encoding::Deflate));
}

#[test]
fn test_missing_header_accepts_everything() {
    let acceptable = parse_acceptable_encodings(None);
    assert_eq!(negotiate(acceptable, &[Encoding::Gzip]), Some(Encoding::Gzip));
    assert_eq!(
        negotiate(acceptable, &[Encoding::Deflate]),
        Some(Encoding::Deflate)
    );
    assert_eq!(negotiate(acceptable, &[]), Some(Encoding::Identity));
}

#[test]
fn test_star_expands_to_unlisted_encodings() {
    let acceptable = parse_acceptable_encodings(Some("gzip;q=0, *"));
    // gzip stays excluded even though * is present
    assert_eq!(negotiate(acceptable, &[Encoding::Gzip]), Some(Encoding::Identity));
}

#[test]
fn test_x_gzip_alias() {
    let acceptable = parse_acceptable_encodings(Some("x-gzip"));
    assert_eq!(negotiate(acceptable, &[Encoding::Gzip]), Some(Encoding::Gzip));
}

#[test]
fn test_unknown_encodings_are_ignored() {
    let acceptable = parse_acceptable_encodings(Some("br, zstd, gzip"));
    assert_eq!(negotiate(acceptable, &[Encoding::Gzip]), Some(Encoding::Gzip));
}

#[test]
fn test_preference_order_is_respected() {
    let acceptable = parse_acceptable_encodings(Some("gzip, deflate"));
    assert_eq!(
        negotiate(acceptable, &[Encoding::Deflate, Encoding::Gzip]),
        Some(Encoding::Deflate)
    );
}
