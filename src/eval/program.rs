//! Batch program composition.
//!
//! Each evaluation writes one self-contained R program to the session's
//! stdin. The program runs the user's code through `evaluate::evaluate` in
//! the persistent `user_env`, prints the visible output, one sentinel line per
//! captured artifact, a JSON snapshot of `user_env`, and finally the
//! completion sentinel. Sentinels are stamped per call and always start a
//! line.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::eval::chunk::{file_safe_label, ChunkOptions};

/// Written once, right after a session process starts.
pub const SESSION_PREAMBLE: &str = r#"library(jsonlite)
if (!exists("user_env")) {
  user_env <- new.env()
}
options(browser = 'false')
options(bitmapType = 'cairo')
options(device = function(...) jpeg(filename = tempfile(), width = 800, height = 600, ...))
"#;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Marker strings for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    pub stamp: String,
    /// Ends the call's output.
    pub completion: String,
    /// Prefixes an image artifact line.
    pub image: String,
    /// Precedes the environment snapshot.
    pub environment: String,
    /// Prefixes a widget artifact line.
    pub widget: String,
}

impl Sentinels {
    /// Fresh sentinels: millisecond timestamp plus a process-wide sequence.
    pub fn generate() -> Self {
        let stamp = format!(
            "{}_{}",
            Utc::now().timestamp_millis(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        Self::from_stamp(&stamp)
    }

    pub fn from_stamp(stamp: &str) -> Self {
        Sentinels {
            stamp: stamp.to_string(),
            completion: format!("__END_OF_OUTPUT__{}__", stamp),
            image: format!("__PLOT_PATH__{}__", stamp),
            environment: format!("__ENVIRONMENT_DATA__{}__", stamp),
            widget: format!("__WIDGET_PATH__{}__", stamp),
        }
    }
}

/// Everything that varies between programs.
#[derive(Debug, Clone)]
pub struct ProgramSpec<'a> {
    pub code: &'a str,
    pub label: &'a str,
    pub options: ChunkOptions,
    pub help: bool,
    pub scratch_dir: &'a Path,
    pub help_file: &'a Path,
    pub sentinels: &'a Sentinels,
    pub preview_chars: usize,
}

/// Quote a string as an R string literal.
///
/// JSON string escapes are a subset of what the R parser accepts.
pub fn r_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// R paths always use forward slashes.
fn r_path(path: &Path) -> String {
    r_string(&path.to_string_lossy().replace('\\', "/"))
}

fn r_bool(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

const HEADER: &str = r#"suppressPackageStartupMessages({
  library(evaluate)
  library(jsonlite)
})
if (!exists("user_env")) {
  user_env <- new.env()
}
.ridian_opts <- list(echo = <<ECHO>>, warning = <<WARNING>>, error = <<ERROR>>, include = <<INCLUDE>>, output = <<OUTPUT>>)
.ridian_show <- .ridian_opts$output && .ridian_opts$include
if (requireNamespace("htmlwidgets", quietly = TRUE)) {
  registerS3method("print", "htmlwidget", function(x, ..., viewer = NULL) {
    widget_file <- paste0("widget_", <<LABEL>>, "_", format(Sys.time(), "%Y%m%d%H%M%S"), ".html")
    htmlwidgets::saveWidget(x, file.path(<<SCRATCH>>, widget_file), selfcontained = TRUE)
    cat(<<WIDGET>>, widget_file, "\n", sep = "")
    invisible(x)
  }, envir = asNamespace("htmlwidgets"))
}
.ridian_start <- Sys.time()
"#;

const HELP_OVERRIDE: &str = r#"print.help_files_with_topic <- function(x, ...) {
  paths <- as.character(x)
  if (length(paths) == 0) {
    writeLines(gettextf("No documentation for %s in specified packages and libraries", sQuote(attr(x, "topic"))))
    return(invisible(x))
  }
  file <- paths[1L]
  tools::Rd2HTML(utils:::.getHelpFile(file), out = <<HELP_FILE>>, package = basename(dirname(dirname(file))))
  invisible(x)
}
"#;

const BODY: &str = r#".ridian_results <- evaluate(<<CODE>>, envir = user_env)
.ridian_outputs <- character()
.ridian_images <- character()
for (.ridian_res in .ridian_results) {
  if (inherits(.ridian_res, "source")) {
    next
  } else if (inherits(.ridian_res, "warning")) {
    if (.ridian_opts$warning && .ridian_opts$include) {
      .ridian_outputs <- c(.ridian_outputs, paste("Warning:", conditionMessage(.ridian_res)))
    }
  } else if (inherits(.ridian_res, "message")) {
    if (.ridian_show) {
      .ridian_outputs <- c(.ridian_outputs, sub("\n$", "", conditionMessage(.ridian_res)))
    }
  } else if (inherits(.ridian_res, "error")) {
    if (.ridian_opts$error && .ridian_opts$include) {
      .ridian_outputs <- c(.ridian_outputs, paste("Error:", conditionMessage(.ridian_res)))
    }
  } else if (is.character(.ridian_res)) {
    if (.ridian_show) {
      .ridian_outputs <- c(.ridian_outputs, .ridian_res)
    }
  } else if (inherits(.ridian_res, "recordedplot")) {
    if (.ridian_show) {
      .ridian_plot <- paste0("plot_", <<LABEL>>, "_", length(.ridian_images) + 1, "_", format(Sys.time(), "%Y%m%d%H%M%S"), ".jpg")
      jpeg(filename = file.path(<<SCRATCH>>, .ridian_plot), width = 800, height = 600)
      replayPlot(.ridian_res)
      invisible(dev.off())
      .ridian_images <- c(.ridian_images, .ridian_plot)
    }
  }
}
if (.ridian_show && requireNamespace("gganimate", quietly = TRUE)) {
  .ridian_anim <- tryCatch(as.character(gganimate::last_animation())[1], error = function(e) NA_character_)
  if (!is.na(.ridian_anim) && file.exists(.ridian_anim) && file.info(.ridian_anim)$mtime > .ridian_start) {
    .ridian_gif <- paste0("animation_", <<LABEL>>, "_", format(Sys.time(), "%Y%m%d%H%M%S"), ".gif")
    invisible(file.copy(.ridian_anim, file.path(<<SCRATCH>>, .ridian_gif)))
    .ridian_images <- c(.ridian_images, .ridian_gif)
  }
}
if (.ridian_show) {
  if (length(.ridian_outputs) > 0) {
    cat(paste(.ridian_outputs, collapse = "\n"), "\n", sep = "")
  }
  for (.ridian_img in .ridian_images) {
    cat(<<IMAGE>>, .ridian_img, "\n", sep = "")
  }
}
.ridian_env <- lapply(ls(envir = user_env), function(var_name) {
  var_value <- get(var_name, envir = user_env)
  list(
    name = var_name,
    type = class(var_value),
    size = as.numeric(object.size(var_value)),
    value = substr(paste(capture.output(str(var_value, max.level = 0)), collapse = " "), 1, <<PREVIEW>>)
  )
})
cat("\n", <<ENVIRONMENT>>, "\n", sep = "")
cat(toJSON(.ridian_env, auto_unbox = TRUE))
cat("\n", <<COMPLETION>>, "\n", sep = "")
"#;

/// Compose the R program for one evaluation.
pub fn compose_program(spec: &ProgramSpec<'_>) -> String {
    let options = spec.options;
    let label = r_string(&file_safe_label(spec.label));
    let scratch = r_path(spec.scratch_dir);

    let mut program = String::with_capacity(HEADER.len() + HELP_OVERRIDE.len() + BODY.len());
    program.push_str(
        &HEADER
            .replace("<<ECHO>>", r_bool(options.echo))
            .replace("<<WARNING>>", r_bool(options.warning))
            .replace("<<ERROR>>", r_bool(options.error))
            .replace("<<INCLUDE>>", r_bool(options.include))
            .replace("<<OUTPUT>>", r_bool(options.output))
            .replace("<<WIDGET>>", &r_string(&spec.sentinels.widget))
            .replace("<<LABEL>>", &label)
            .replace("<<SCRATCH>>", &scratch),
    );
    if spec.help {
        program.push_str(&HELP_OVERRIDE.replace("<<HELP_FILE>>", &r_path(spec.help_file)));
    }
    // Substitute the user code last so that placeholder-like text inside it
    // is left alone.
    let body = BODY
        .replace("<<LABEL>>", &label)
        .replace("<<SCRATCH>>", &scratch)
        .replace("<<IMAGE>>", &r_string(&spec.sentinels.image))
        .replace("<<ENVIRONMENT>>", &r_string(&spec.sentinels.environment))
        .replace("<<COMPLETION>>", &r_string(&spec.sentinels.completion))
        .replace("<<PREVIEW>>", &spec.preview_chars.max(1).to_string())
        .replace("<<CODE>>", &r_string(spec.code));
    program.push_str(&body);
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn compose(code: &str, options: ChunkOptions, help: bool) -> (String, Sentinels) {
        let sentinels = Sentinels::from_stamp("1700000000000_7");
        let scratch = PathBuf::from("/tmp/rplots-abc123");
        let help_file = scratch.join("help_lbl.html");
        let program = compose_program(&ProgramSpec {
            code,
            label: "lbl",
            options,
            help,
            scratch_dir: &scratch,
            help_file: &help_file,
            sentinels: &sentinels,
            preview_chars: 200,
        });
        (program, sentinels)
    }

    #[test]
    fn test_sentinels_share_stamp() {
        let s = Sentinels::from_stamp("42_1");
        assert_eq!(s.completion, "__END_OF_OUTPUT__42_1__");
        assert_eq!(s.image, "__PLOT_PATH__42_1__");
        assert_eq!(s.environment, "__ENVIRONMENT_DATA__42_1__");
        assert_eq!(s.widget, "__WIDGET_PATH__42_1__");
    }

    #[test]
    fn test_generated_sentinels_are_unique() {
        let a = Sentinels::generate();
        let b = Sentinels::generate();
        assert_ne!(a.completion, b.completion);
    }

    #[test]
    fn test_r_string_escapes() {
        assert_eq!(r_string("a \"b\"\n"), r#""a \"b\"\n""#);
        assert_eq!(r_string(r"C:\temp"), r#""C:\\temp""#);
    }

    #[test]
    fn test_program_embeds_code_and_sentinels() {
        let (program, sentinels) = compose("x <- 1\nprint(x)", ChunkOptions::default(), false);
        assert!(program.contains(r#"evaluate("x <- 1\nprint(x)", envir = user_env)"#));
        assert!(program.contains(&format!("cat(\"\\n\", \"{}\", \"\\n\", sep = \"\")", sentinels.completion)));
        assert!(program.contains(&sentinels.environment));
        assert!(program.contains(&sentinels.image));
        assert!(program.contains(&sentinels.widget));
        assert!(program.contains(r#"file.path("/tmp/rplots-abc123", .ridian_plot)"#));
        assert!(!program.contains("<<"));
        assert!(!program.contains("print.help_files_with_topic"));
    }

    #[test]
    fn test_program_reflects_options() {
        let options = ChunkOptions {
            output: false,
            ..ChunkOptions::default()
        };
        let (program, _) = compose("1 + 1", options, false);
        assert!(program.contains("include = TRUE, output = FALSE)"));
    }

    #[test]
    fn test_help_program_writes_help_file() {
        let (program, _) = compose("?mean", ChunkOptions::default(), true);
        assert!(program.contains("print.help_files_with_topic"));
        assert!(program.contains(r#"out = "/tmp/rplots-abc123/help_lbl.html""#));
    }

    #[test]
    fn test_placeholder_text_in_code_is_preserved() {
        let (program, _) = compose("s <- \"<<LABEL>>\"", ChunkOptions::default(), false);
        assert!(program.contains(r#"evaluate("s <- \"<<LABEL>>\"", envir = user_env)"#));
    }

    #[test]
    fn test_label_is_file_safe_in_artifact_names() {
        let sentinels = Sentinels::from_stamp("1_1");
        let scratch = PathBuf::from("/tmp/rplots-abc123");
        let program = compose_program(&ProgramSpec {
            code: "plot(1)",
            label: "results/fig 1",
            options: ChunkOptions::default(),
            help: false,
            scratch_dir: &scratch,
            help_file: &scratch.join("help.html"),
            sentinels: &sentinels,
            preview_chars: 200,
        });
        assert!(program.contains(r#"paste0("plot_", "results_fig_1", "_""#));
        assert!(!program.contains("results/fig"));
    }
}
