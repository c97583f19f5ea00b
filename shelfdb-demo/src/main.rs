use shelfdb::{changes, Access, Filtering, Store};
use std::error::Error;

mod board;

use board::{Board, Status, Task};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("ERROR:{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let path = std::env::var("SHELFDB_DEMO_PATH").unwrap_or_else(|_| "demo.db".to_string());
    log::info!("Opening store at: {path}");
    let store = Store::open(&path)?;
    let board = Board::open(&store)?;

    board.tasks.remove_all(Access::Default)?;
    let seed = [
        Task::new("t1", "Write release notes", Status::Todo, 2),
        Task::new("t2", "Fix sync bug", Status::Doing, 8),
        Task::new("t3", "Review schema", Status::Todo, 5),
        Task::new("t4", "Ship build", Status::Done, 3),
    ];
    let connection = store.connection("demo")?;
    connection.read_write(|tx| {
        for task in &seed {
            board.tasks.persist(task, None, tx)?;
        }
        Ok(())
    })?;

    print_groups("by status", &board.by_status)?;
    print_groups("large tasks", &board.large)?;

    board.today.add_item(&seed[2], "today", Access::Default)?;
    board.today.insert_item(&seed[1], 0, "today", Access::Default)?;
    print_groups("today", &board.today)?;

    let notifications = store.subscribe();
    let mut mapping = board.by_status.mapping(Access::Default)?;

    let mut moved = seed[0].clone();
    moved.status = Status::Doing;
    board.tasks.persist(&moved, None, Access::Default)?;
    board.tasks.remove_key("t4", Access::Default)?;
    board
        .tasks
        .persist(&Task::new("t5", "Archive logs", Status::Todo, 1), None, Access::Default)?;

    let received: Vec<_> = notifications.try_iter().collect();
    let delta = changes(&received, &mapping)?;
    println!("changes since snapshot {:?}:", mapping.snapshot());
    for section in &delta.sections {
        println!("  section {:?} '{}' at {}", section.kind, section.group, section.index);
    }
    for row in &delta.rows {
        println!("  row {:?} {} {:?} -> {:?}", row.kind, row.key, row.from, row.to);
    }
    mapping = delta.mapping;
    println!("now {} sections, {} items", mapping.number_of_sections(), mapping.number_of_items());

    let tag = board
        .large
        .update_filtering(Filtering::by_object(|t: &Task| t.points <= 2), None)?;
    log::info!("large tasks filter replaced, version {tag}");
    print_groups("small tasks", &board.large)?;

    Ok(())
}

fn print_groups(title: &str, view: &shelfdb::View<Task>) -> Result<(), Box<dyn Error>> {
    println!("{title}:");
    for group in view.groups(Access::Default)? {
        let titles: Vec<String> = view
            .items(&group, Access::Default)?
            .into_iter()
            .map(|t| t.title)
            .collect();
        println!("  {group}: {}", titles.join(", "));
    }
    Ok(())
}
