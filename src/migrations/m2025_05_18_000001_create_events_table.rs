use crate::descriptor::ChangeDescriptor;
use crate::schema::Blueprint;

pub const ID: &str = "2025_05_18_000001_create_events_table";

pub fn descriptor() -> ChangeDescriptor {
    ChangeDescriptor::create_table(
        ID,
        Blueprint::create("events")
            .id("id")
            .string("name", 255)
            .text("description")
            .nullable()
            .string("location", 255)
            .nullable()
            .date("startDate")
            .date("endDate")
            .timestamps(),
    )
}
