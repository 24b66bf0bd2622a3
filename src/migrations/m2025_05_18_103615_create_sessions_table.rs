use crate::core::{ForeignKey, ReferentialAction};
use crate::descriptor::ChangeDescriptor;
use crate::schema::Blueprint;

pub const ID: &str = "2025_05_18_103615_create_sessions_table";

/// Sessions belong to an event and disappear with it.
pub fn descriptor() -> ChangeDescriptor {
    ChangeDescriptor::create_table(
        ID,
        Blueprint::create("event_sessions")
            .id("id")
            .string("title", 255)
            .string("speaker", 255)
            .nullable()
            .time("startTime")
            .time("endTime")
            .foreign_id("event_id")
            .foreign(
                ForeignKey::new("event_sessions_event_id_foreign", "event_id", "events", "id")
                    .on_delete(ReferentialAction::Cascade),
            )
            .timestamps(),
    )
}
