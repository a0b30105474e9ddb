use std::time::SystemTime;

use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

const HTTP_DATE_FORMAT: &[FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Formats a timestamp as IMF-fixdate, truncated to the second.
#[must_use]
pub(crate) fn systemtime_to_http_datetime(time: SystemTime) -> Option<String> {
    let odt = OffsetDateTime::from(time).replace_nanosecond(0).ok()?;

    odt.format(HTTP_DATE_FORMAT).ok()
}
