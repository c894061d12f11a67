use crate::storage::DaemonRef;

const PLACEHOLDER: &str = "{daemon}";

/// Replace `{daemon}` placeholders with daemon tags, in order.
///
/// Placeholders beyond the number of referenced daemons are kept as they are.
pub fn render_report(content: &str, refs: &[DaemonRef]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut refs = refs.iter();
    let mut rest = content;
    while let Some(pos) = rest.find(PLACEHOLDER) {
        out.push_str(&rest[..pos]);
        match refs.next() {
            Some(daemon) => out.push_str(&daemon_tag(daemon)),
            None => out.push_str(PLACEHOLDER),
        }
        rest = &rest[pos + PLACEHOLDER.len()..];
    }
    out.push_str(rest);
    out
}

fn daemon_tag(daemon: &DaemonRef) -> String {
    format!(
        r#"<daemon id="{}" name="{}" appId="{}" appType="{}">"#,
        daemon.id,
        daemon.name,
        daemon.app_id,
        daemon.app_type.as_str()
    )
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::AppType;

    fn daemon(id: i64, app_id: i64) -> DaemonRef {
        DaemonRef {
            id,
            name: "dhcp4".into(),
            app_id,
            app_name: format!("kea@{app_id}"),
            app_type: AppType::Kea,
        }
    }

    #[test]
    fn placeholders_replaced_in_order() {
        let rendered = render_report(
            "ID 7 in {daemon} and ID 9 in {daemon}.",
            &[daemon(1, 10), daemon(2, 20)],
        );
        assert_eq!(
            rendered,
            r#"ID 7 in <daemon id="1" name="dhcp4" appId="10" appType="kea"> and ID 9 in <daemon id="2" name="dhcp4" appId="20" appType="kea">."#
        );
    }

    #[test]
    fn excess_placeholders_left_literal() {
        let rendered = render_report("{daemon} vs {daemon}", &[daemon(3, 30)]);
        assert_eq!(
            rendered,
            r#"<daemon id="3" name="dhcp4" appId="30" appType="kea"> vs {daemon}"#
        );
    }

    #[test]
    fn content_without_placeholders_unchanged() {
        assert_eq!(render_report("all good", &[daemon(1, 1)]), "all good");
    }
}
