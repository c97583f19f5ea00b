use serde::{Deserialize, Serialize};
use shelfdb::{
    Collection, Filtering, Grouping, ManualView, Result, Sorting, Store, View, ViewOptions,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub points: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Todo,
    Doing,
    Done,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::Doing => "doing",
            Status::Done => "done",
        }
    }
}

impl Task {
    pub fn new(id: &str, title: &str, status: Status, points: u32) -> Self {
        Task {
            id: id.to_string(),
            title: title.to_string(),
            status,
            points,
        }
    }
}

/// Collection plus the views the demo shows.
pub struct Board {
    pub tasks: Collection<Task>,
    pub by_status: View<Task>,
    pub large: shelfdb::FilteredView<Task>,
    pub today: ManualView<Task>,
}

impl Board {
    pub fn open(store: &Store) -> Result<Self> {
        let tasks: Collection<Task> = Collection::builder("tasks")
            .key_fn(|t: &Task| t.id.clone())
            .build();
        tasks.register(store)?;

        let by_status = tasks.view(
            ViewOptions::new("tasks.by-status").version_tag("1"),
            Grouping::by_object(|t: &Task| Some(t.status.as_str().to_string())),
            Sorting::by_comparing(|t: &Task| t.title.clone(), true),
        )?;
        let large = by_status.filtered(
            ViewOptions::new("tasks.large").persistent(false),
            Filtering::by_object(|t: &Task| t.points >= 5),
        )?;
        let today = tasks.manual_view(ViewOptions::new("tasks.today"))?;

        Ok(Board {
            tasks,
            by_status,
            large,
            today,
        })
    }
}
